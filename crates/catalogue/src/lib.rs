//! Registry mapping a language id to everything the sandbox driver needs to
//! launch a program: the image, the command template, and feature flags.
//!
//! Adding a language is a catalogue-only change — no other component in the
//! orchestrator encodes per-language behavior.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder substituted with the absolute path of the entry file inside
/// the sandbox working directory.
pub const VAR_ENTRY_FILE: &str = "{{entry_file}}";
/// Placeholder substituted with the sandbox's scratch directory.
pub const VAR_SCRATCH_DIR: &str = "{{scratch_dir}}";

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}

/// An extra bind mount beyond the project working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtraMount {
    pub host_path: String,
    pub sandbox_path: String,
    pub read_only: bool,
}

/// One catalogue entry: everything needed to launch one language's program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LanguageEntry {
    pub language_id: String,
    pub image_ref: String,
    pub default_file_name: String,
    /// Optional build step run before `run_command`, same template variables.
    pub build_command: Option<String>,
    /// Template over `VAR_ENTRY_FILE` / `VAR_SCRATCH_DIR`.
    pub run_command: String,
    pub file_extensions: Vec<String>,
    pub allow_network: bool,
    pub extra_mounts: Vec<ExtraMount>,
}

impl LanguageEntry {
    fn render(template: &str, entry_file: &str, scratch_dir: &str) -> String {
        template
            .replace(VAR_ENTRY_FILE, entry_file)
            .replace(VAR_SCRATCH_DIR, scratch_dir)
    }

    /// Render `run_command` against a concrete entry-file path and scratch dir.
    pub fn rendered_run_command(&self, entry_file: &str, scratch_dir: &str) -> String {
        Self::render(&self.run_command, entry_file, scratch_dir)
    }

    /// Render `build_command`, if this language needs a compile step.
    pub fn rendered_build_command(&self, entry_file: &str, scratch_dir: &str) -> Option<String> {
        self.build_command
            .as_deref()
            .map(|tpl| Self::render(tpl, entry_file, scratch_dir))
    }
}

/// Read-mostly registry keyed by language id.
#[derive(Debug, Clone)]
pub struct LanguageCatalogue {
    entries: HashMap<String, LanguageEntry>,
}

impl LanguageCatalogue {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The catalogue pre-populated with the languages this orchestrator
    /// ships support for out of the box.
    pub fn with_builtin_defaults() -> Self {
        let mut cat = Self::new();
        for entry in builtin_entries() {
            cat.insert(entry);
        }
        cat
    }

    pub fn insert(&mut self, entry: LanguageEntry) {
        self.entries.insert(entry.language_id.clone(), entry);
    }

    pub fn get(&self, language_id: &str) -> Result<&LanguageEntry, CatalogueError> {
        self.entries
            .get(language_id)
            .ok_or_else(|| CatalogueError::UnsupportedLanguage(language_id.to_string()))
    }

    pub fn is_supported(&self, language_id: &str) -> bool {
        self.entries.contains_key(language_id)
    }

    pub fn language_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for LanguageCatalogue {
    fn default() -> Self {
        Self::with_builtin_defaults()
    }
}

fn builtin_entries() -> Vec<LanguageEntry> {
    vec![
        LanguageEntry {
            language_id: "python".into(),
            image_ref: "orchestrator/runner-python:3.12".into(),
            default_file_name: "main.py".into(),
            build_command: None,
            run_command: format!("python3 {VAR_ENTRY_FILE}"),
            file_extensions: vec!["py".into()],
            allow_network: false,
            extra_mounts: vec![],
        },
        LanguageEntry {
            language_id: "javascript".into(),
            image_ref: "orchestrator/runner-node:20".into(),
            default_file_name: "main.js".into(),
            build_command: None,
            run_command: format!("node {VAR_ENTRY_FILE}"),
            file_extensions: vec!["js".into(), "mjs".into()],
            allow_network: false,
            extra_mounts: vec![],
        },
        LanguageEntry {
            language_id: "typescript".into(),
            image_ref: "orchestrator/runner-node:20".into(),
            default_file_name: "main.ts".into(),
            build_command: None,
            run_command: format!("npx -y tsx {VAR_ENTRY_FILE}"),
            file_extensions: vec!["ts".into()],
            allow_network: false,
            extra_mounts: vec![],
        },
        LanguageEntry {
            language_id: "rust".into(),
            image_ref: "orchestrator/runner-rust:1.80".into(),
            default_file_name: "main.rs".into(),
            build_command: Some(format!(
                "rustc {VAR_ENTRY_FILE} -O -o {VAR_SCRATCH_DIR}/a.out"
            )),
            run_command: format!("{VAR_SCRATCH_DIR}/a.out"),
            file_extensions: vec!["rs".into()],
            allow_network: false,
            extra_mounts: vec![],
        },
        LanguageEntry {
            language_id: "go".into(),
            image_ref: "orchestrator/runner-go:1.22".into(),
            default_file_name: "main.go".into(),
            build_command: None,
            run_command: format!("go run {VAR_ENTRY_FILE}"),
            file_extensions: vec!["go".into()],
            allow_network: false,
            extra_mounts: vec![],
        },
        LanguageEntry {
            language_id: "cpp".into(),
            image_ref: "orchestrator/runner-cpp:gcc13".into(),
            default_file_name: "main.cpp".into(),
            build_command: Some(format!(
                "g++ {VAR_ENTRY_FILE} -O2 -o {VAR_SCRATCH_DIR}/a.out"
            )),
            run_command: format!("{VAR_SCRATCH_DIR}/a.out"),
            file_extensions: vec!["cpp".into(), "cc".into()],
            allow_network: false,
            extra_mounts: vec![],
        },
        LanguageEntry {
            language_id: "git-worker".into(),
            image_ref: "orchestrator/git-worker:latest".into(),
            default_file_name: String::new(),
            build_command: None,
            run_command: "/usr/local/bin/git-worker".into(),
            file_extensions: vec![],
            allow_network: true,
            extra_mounts: vec![],
        },
    ]
}
