use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkPolicy {
    None,
    Allow,
}

/// Everything needed to allocate one isolation unit, per spec.md §4.2
/// `Create(spec)`. Derived by the orchestrator from the `LanguageCatalogue`
/// entry and the cached `SettingsStore` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub image_ref: String,
    /// Fractional CPU cores, e.g. `0.5` for half a core.
    pub cpu_share: f64,
    pub memory_limit_mb: u64,
    pub max_pids: u32,
    pub network_policy: NetworkPolicy,
    pub env: HashMap<String, String>,
    /// Extra read-only bind mounts beyond the single writable working dir.
    pub extra_mounts: Vec<ExtraMountSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraMountSpec {
    pub host_path: String,
    pub sandbox_path: String,
    pub read_only: bool,
}

impl SandboxSpec {
    pub fn single_file_runner(image_ref: impl Into<String>, cpu_share: f64, memory_limit_mb: u64) -> Self {
        Self {
            image_ref: image_ref.into(),
            cpu_share,
            memory_limit_mb,
            max_pids: 64,
            network_policy: NetworkPolicy::None,
            env: HashMap::new(),
            extra_mounts: Vec::new(),
        }
    }
}
