use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::spec::SandboxSpec;

/// Default deadline applied to any driver operation that does not receive an
/// explicit one; no operation blocks indefinitely (spec.md §4.2).
pub const DEFAULT_OP_DEADLINE: Duration = Duration::from_secs(10);

/// Opaque handle to one isolation unit. Cheap to clone; clones share the
/// same destroyed-flag so every caller observes `Destroy` immediately.
#[derive(Debug, Clone)]
pub struct Handle {
    pub id: Uuid,
    pub(crate) backend_id: Arc<str>,
    destroyed: Arc<AtomicBool>,
}

impl Handle {
    pub fn new(backend_id: impl Into<Arc<str>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id: backend_id.into(),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_id(id: Uuid, backend_id: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            backend_id: backend_id.into(),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Handle {}

/// Outcome of the program's process exiting on its own, distinct from the
/// orchestrator's higher-level `TerminationReason` (which also accounts for
/// timeout/stop/kill).
#[derive(Debug, Clone, Copy)]
pub struct ExitOutcome {
    pub exit_code: Option<i32>,
    pub oom_killed: bool,
}

/// Read ends of standard streams plus an exit waiter, returned by `Start`.
pub struct StreamEndpoints {
    pub stdout: mpsc::Receiver<Bytes>,
    pub stderr: mpsc::Receiver<Bytes>,
    pub exit: oneshot::Receiver<ExitOutcome>,
}

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    pub pids: u32,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    Graceful,
    Forced,
}

/// Uniform lifecycle for one isolation unit, regardless of backend
/// (container runtime assumed — spec.md §4.2, §9 "Not specified").
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    async fn create(&self, spec: &SandboxSpec) -> Result<Handle>;

    /// Seeds a file under the working directory. Rejects traversal.
    async fn write_file(&self, handle: &Handle, relpath: &str, bytes: Vec<u8>) -> Result<()>;

    /// Starts execution. `stdin_bytes` is delivered as a single bounded
    /// buffer and the stream is closed afterward — no interactive input.
    async fn start(&self, handle: &Handle, stdin_bytes: Vec<u8>, run_command: String) -> Result<StreamEndpoints>;

    async fn sample(&self, handle: &Handle) -> Result<Sample>;

    async fn signal(&self, handle: &Handle, signal: TermSignal) -> Result<()>;

    async fn destroy(&self, handle: &Handle) -> Result<()>;
}

/// Joins `relpath` onto `base`, rejecting absolute paths, `..` components,
/// and anything that would resolve outside `base`. Mirrors spec.md §4.2
/// ("rejects traversal (`..`, absolute, symlink escapes)").
pub fn safe_join(base: &Path, relpath: &str) -> Result<PathBuf> {
    let rel = Path::new(relpath);
    if rel.is_absolute() {
        return Err(SandboxError::PathTraversal(relpath.to_string()));
    }
    let mut resolved = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::PathTraversal(relpath.to_string()));
            }
        }
    }
    if !resolved.starts_with(base) {
        return Err(SandboxError::PathTraversal(relpath.to_string()));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_accepts_nested_relative_path() {
        let base = Path::new("/work");
        let joined = safe_join(base, "src/main.py").unwrap();
        assert_eq!(joined, Path::new("/work/src/main.py"));
    }

    #[test]
    fn safe_join_rejects_parent_traversal() {
        let base = Path::new("/work");
        let err = safe_join(base, "../etc/passwd").unwrap_err();
        assert!(matches!(err, SandboxError::PathTraversal(_)));
    }

    #[test]
    fn safe_join_rejects_absolute_path() {
        let base = Path::new("/work");
        let err = safe_join(base, "/etc/passwd").unwrap_err();
        assert!(matches!(err, SandboxError::PathTraversal(_)));
    }

    #[test]
    fn safe_join_rejects_embedded_traversal() {
        let base = Path::new("/work");
        let err = safe_join(base, "src/../../etc/passwd").unwrap_err();
        assert!(matches!(err, SandboxError::PathTraversal(_)));
    }

    #[test]
    fn handle_destroyed_flag_is_shared_across_clones() {
        let handle = Handle::new("container-1");
        let clone = handle.clone();
        handle.mark_destroyed();
        assert!(clone.is_destroyed());
    }
}
