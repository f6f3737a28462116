//! C9 `GitRunner`: a `Sandbox`-backed specialisation that runs the fixed
//! git-worker image against a JSON operation descriptor, parses its result
//! envelope, and applies a post-op upload with credential redaction
//! (spec.md §4.9, §6.6).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use catalogue::LanguageCatalogue;
use sandbox::{BlobSync, NetworkPolicy, SandboxDriver, SandboxSpec};

use crate::error::{OrchestratorError, Result};

pub const RESULT_START_MARKER: &str = "__GIT_RESULT_START__";
pub const RESULT_END_MARKER: &str = "__GIT_RESULT_END__";

/// git-worker operations this runner is a thin transport for; semantics are
/// opaque to the orchestrator (spec.md §4.9).
pub const SUPPORTED_OPERATIONS: &[&str] = &[
    "init",
    "status",
    "add",
    "commit",
    "push",
    "pull",
    "clone",
    "add-remote",
    "remove-remote",
    "list-remotes",
    "validate",
    "check-repo",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitResult {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// What a post-op upload should cover. Most write operations only touch
/// `.git`; `clone`/`pull` can also change tracked working-tree files.
/// Read-only operations upload nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadScope {
    None,
    GitOnly,
    Workspace,
}

fn upload_scope(op: &str) -> UploadScope {
    match op {
        "status" | "list-remotes" | "validate" | "check-repo" => UploadScope::None,
        "clone" | "pull" => UploadScope::Workspace,
        "init" | "add" | "commit" | "push" | "add-remote" | "remove-remote" => UploadScope::GitOnly,
        _ => UploadScope::Workspace,
    }
}

/// Rewrites any `scheme://token@host/...` remote URL embedded in `.git/config`
/// (or a raw remote URL string) back to its bare form, per spec.md §6.6 /
/// testable property 6.
pub fn redact_credentials(text: &str) -> String {
    let pattern = Regex::new(r"://[^/@\s]+@").expect("static regex is valid");
    pattern.replace_all(text, "://").into_owned()
}

pub struct GitRunner<D: SandboxDriver> {
    driver: Arc<D>,
    catalogue: Arc<LanguageCatalogue>,
    blob_sync: BlobSync,
}

impl<D: SandboxDriver> GitRunner<D> {
    pub fn new(driver: Arc<D>, catalogue: Arc<LanguageCatalogue>, blob_sync: BlobSync) -> Self {
        Self {
            driver,
            catalogue,
            blob_sync,
        }
    }

    pub async fn execute(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        op: &str,
        data: Value,
        credentials: &str,
        project_prefix: &str,
        workdir: &Path,
    ) -> Result<GitResult> {
        let entry = self.catalogue.get("git-worker")?;

        let mut env = HashMap::new();
        env.insert("GIT_WORKER_OP".to_string(), op.to_string());
        env.insert(
            "GIT_WORKER_DATA".to_string(),
            serde_json::to_string(&data).unwrap_or_default(),
        );
        env.insert("GIT_WORKER_USER_ID".to_string(), user_id.to_string());
        env.insert("GIT_WORKER_PROJECT_ID".to_string(), project_id.to_string());
        env.insert("GIT_WORKER_CREDENTIALS".to_string(), credentials.to_string());

        let spec = SandboxSpec {
            image_ref: entry.image_ref.clone(),
            cpu_share: 0.5,
            memory_limit_mb: 256,
            max_pids: 64,
            network_policy: if entry.allow_network {
                NetworkPolicy::Allow
            } else {
                NetworkPolicy::None
            },
            env,
            extra_mounts: Vec::new(),
        };

        let handle = self.driver.create(&spec).await?;

        let cancel = CancellationToken::new();
        if let Err(err) = self
            .blob_sync
            .pull(project_prefix, workdir, &cancel)
            .await
        {
            debug!(%project_id, error = %err, "git-worker pre-op pull found nothing to materialise");
        }

        let run_command = entry.rendered_run_command("", "");
        let result = self.run_and_parse(&handle, run_command).await;

        let scope = upload_scope(op);
        if result.is_ok() {
            if let Err(err) = self.upload_after_op(workdir, project_prefix, scope, &cancel).await {
                warn!(%project_id, error = %err, "post-op upload failed");
            }
        }

        let _ = self.driver.destroy(&handle).await;
        result
    }

    async fn run_and_parse(&self, handle: &sandbox::Handle, run_command: String) -> Result<GitResult> {
        let mut endpoints = self
            .driver
            .start(handle, Vec::new(), run_command)
            .await?;

        let mut stdout_buf = Vec::new();
        while let Some(chunk) = endpoints.stdout.recv().await {
            stdout_buf.extend_from_slice(&chunk);
        }
        let mut stderr_buf = Vec::new();
        while let Some(chunk) = endpoints.stderr.recv().await {
            stderr_buf.extend_from_slice(&chunk);
        }
        let _ = tokio::time::timeout(Duration::from_secs(30), endpoints.exit).await;

        if !stderr_buf.is_empty() {
            debug!(stderr = %String::from_utf8_lossy(&stderr_buf), "git-worker diagnostics");
        }

        let stdout = String::from_utf8_lossy(&stdout_buf);
        Ok(parse_envelope(&stdout))
    }

    async fn upload_after_op(
        &self,
        workdir: &Path,
        project_prefix: &str,
        scope: UploadScope,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if scope == UploadScope::None {
            return Ok(());
        }

        let git_config = workdir.join(".git").join("config");
        if let Ok(contents) = tokio::fs::read_to_string(&git_config).await {
            let redacted = redact_credentials(&contents);
            if redacted != contents {
                tokio::fs::write(&git_config, redacted).await.map_err(|e| {
                    OrchestratorError::Internal(format!("failed to rewrite .git/config: {e}"))
                })?;
            }
        }

        let src = match scope {
            UploadScope::GitOnly => workdir.join(".git"),
            UploadScope::Workspace => workdir.to_path_buf(),
            UploadScope::None => unreachable!(),
        };

        self.blob_sync
            .push(&src, project_prefix, cancel)
            .await
            .map_err(OrchestratorError::from)?;
        Ok(())
    }
}

/// Extracts and decodes the `__GIT_RESULT_START__ ... __GIT_RESULT_END__`
/// envelope from standard output. Fabricates a failure result if the
/// envelope is missing or malformed (spec.md §4.9).
pub fn parse_envelope(stdout: &str) -> GitResult {
    let start = match stdout.find(RESULT_START_MARKER) {
        Some(idx) => idx + RESULT_START_MARKER.len(),
        None => return missing_envelope(),
    };
    let end = match stdout[start..].find(RESULT_END_MARKER) {
        Some(idx) => start + idx,
        None => return missing_envelope(),
    };
    let body = stdout[start..end].trim();
    match serde_json::from_str::<GitResult>(body) {
        Ok(result) => result,
        Err(err) => GitResult {
            success: false,
            data: None,
            error: Some(format!("malformed result envelope: {err}")),
        },
    }
}

fn missing_envelope() -> GitResult {
    GitResult {
        success: false,
        data: None,
        error: Some("no result envelope".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_envelope() {
        let stdout = format!(
            "some diagnostic noise\n{}\n{{\"success\":true,\"data\":{{\"branch\":\"main\"}}}}\n{}\ntrailer",
            RESULT_START_MARKER, RESULT_END_MARKER
        );
        let result = parse_envelope(&stdout);
        assert!(result.success);
        assert_eq!(result.data.unwrap()["branch"], "main");
    }

    #[test]
    fn missing_envelope_is_fabricated_as_failure() {
        let result = parse_envelope("no markers here");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no result envelope"));
    }

    #[test]
    fn malformed_json_inside_envelope_is_reported() {
        let stdout = format!("{}\nnot json\n{}", RESULT_START_MARKER, RESULT_END_MARKER);
        let result = parse_envelope(&stdout);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("malformed"));
    }

    #[test]
    fn redacts_token_from_https_remote_url() {
        let config = "[remote \"origin\"]\n\turl = https://ghp_abc123@github.com/acme/repo.git\n";
        let redacted = redact_credentials(config);
        assert_eq!(
            redacted,
            "[remote \"origin\"]\n\turl = https://github.com/acme/repo.git\n"
        );
    }

    #[test]
    fn leaves_credential_free_url_untouched() {
        let config = "url = https://github.com/acme/repo.git\n";
        assert_eq!(redact_credentials(config), config);
    }

    #[test]
    fn upload_scope_classifies_read_only_ops_as_none() {
        assert_eq!(upload_scope("status"), UploadScope::None);
        assert_eq!(upload_scope("commit"), UploadScope::GitOnly);
        assert_eq!(upload_scope("clone"), UploadScope::Workspace);
    }
}
