//! Bulk materialisation of a project's files between the content store and a
//! sandbox working directory (spec.md §4.3).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use store::BlobStore;

use crate::error::{Result, SandboxError};

/// Files and directories `Push` never uploads, mirroring the teacher's use
/// of the `ignore` crate for `.gitignore`-style filtering.
pub const DEFAULT_IGNORE: &[&str] = &[".git", "node_modules", "__pycache__", ".scratch"];

#[derive(Debug, Clone, Copy, Default)]
pub struct PullSummary {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PushSummary {
    pub files: usize,
}

pub struct BlobSync {
    blob_store: Arc<dyn BlobStore>,
}

impl BlobSync {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }

    /// Lists every blob under `project_prefix`, creates directories as
    /// needed, and writes each file atomically (temp-then-rename). Partial
    /// progress on cancellation is not rolled back — the sandbox is
    /// destroyed regardless (spec.md §4.3).
    pub async fn pull(
        &self,
        project_prefix: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PullSummary> {
        let entries = self
            .blob_store
            .list(project_prefix)
            .await
            .map_err(|e| SandboxError::Internal(format!("list blobs: {e}")))?;

        let mut summary = PullSummary::default();
        for entry in entries {
            if cancel.is_cancelled() {
                debug!(project_prefix, "pull cancelled, returning partial progress");
                break;
            }
            let relpath = entry
                .path
                .strip_prefix(project_prefix)
                .unwrap_or(&entry.path)
                .trim_start_matches('/');
            let dest_path = crate::driver::safe_join(dest, relpath)?;

            let bytes = self
                .blob_store
                .get(&entry.path)
                .await
                .map_err(|e| SandboxError::Internal(format!("get blob {}: {e}", entry.path)))?;

            if let Some(parent) = dest_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SandboxError::Internal(format!("mkdir: {e}")))?;
            }
            write_atomic(&dest_path, &bytes).await?;

            summary.files += 1;
            summary.bytes += bytes.len() as u64;
        }
        Ok(summary)
    }

    /// Recursively enumerates regular files under `src`, skipping
    /// `DEFAULT_IGNORE`, and uploads each with upsert semantics.
    pub async fn push(
        &self,
        src: &Path,
        project_prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<PushSummary> {
        let mut summary = PushSummary::default();
        let mut stack = vec![src.to_path_buf()];

        while let Some(dir) = stack.pop() {
            if cancel.is_cancelled() {
                debug!(project_prefix, "push cancelled, returning partial progress");
                break;
            }
            let mut read_dir = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| SandboxError::Internal(format!("read_dir: {e}")))?;

            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| SandboxError::Internal(format!("next_entry: {e}")))?
            {
                let path = entry.path();
                let name = entry.file_name();
                if DEFAULT_IGNORE.iter().any(|ignored| name == *ignored) {
                    continue;
                }
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| SandboxError::Internal(format!("file_type: {e}")))?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let relpath = path
                    .strip_prefix(src)
                    .map_err(|e| SandboxError::Internal(e.to_string()))?;
                let blob_path = format!(
                    "{}/{}",
                    project_prefix.trim_end_matches('/'),
                    relpath.to_string_lossy().replace('\\', "/")
                );

                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| SandboxError::Internal(format!("read {}: {e}", path.display())))?;

                self.blob_store
                    .put(&blob_path, bytes, true)
                    .await
                    .map_err(|e| SandboxError::Internal(format!("put {blob_path}: {e}")))?;

                summary.files += 1;
            }
        }
        Ok(summary)
    }
}

async fn write_atomic(dest: &PathBuf, bytes: &[u8]) -> Result<()> {
    let tmp = dest.with_extension("tmp-pull");
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| SandboxError::Internal(format!("create temp: {e}")))?;
    f.write_all(bytes)
        .await
        .map_err(|e| SandboxError::Internal(format!("write temp: {e}")))?;
    f.flush()
        .await
        .map_err(|e| SandboxError::Internal(format!("flush temp: {e}")))?;
    drop(f);
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| SandboxError::Internal(format!("rename into place: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::InMemoryBlobStore;

    #[tokio::test]
    async fn pull_materialises_every_blob_under_prefix() {
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        blobs
            .put("proj/1/main.py", b"print('hi')".to_vec(), true)
            .await
            .unwrap();
        blobs
            .put("proj/1/lib/util.py", b"x = 1".to_vec(), true)
            .await
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        let sync = BlobSync::new(blobs);
        let summary = sync
            .pull("proj/1/", dest.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.files, 2);
        assert!(dest.path().join("main.py").exists());
        assert!(dest.path().join("lib/util.py").exists());
    }

    #[tokio::test]
    async fn push_uploads_files_and_skips_ignored_dirs() {
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let src = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(src.path().join(".git")).await.unwrap();
        tokio::fs::write(src.path().join(".git/config"), b"ignored").await.unwrap();
        tokio::fs::write(src.path().join("main.py"), b"print(1)").await.unwrap();
        tokio::fs::create_dir_all(src.path().join("pkg")).await.unwrap();
        tokio::fs::write(src.path().join("pkg/mod.py"), b"y = 2").await.unwrap();

        let sync = BlobSync::new(blobs.clone());
        let summary = sync
            .push(src.path(), "proj/1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.files, 2);
        let listed = blobs.list("proj/1/").await.unwrap();
        assert!(listed.iter().any(|e| e.path == "proj/1/main.py"));
        assert!(listed.iter().any(|e| e.path == "proj/1/pkg/mod.py"));
        assert!(!listed.iter().any(|e| e.path.contains(".git")));
    }

    #[tokio::test]
    async fn pull_rejects_traversal_in_listed_blob_names() {
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        blobs.put("proj/1/../../etc/passwd", b"x".to_vec(), true).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        let sync = BlobSync::new(blobs);
        let err = sync
            .pull("proj/1/", dest.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathTraversal(_)));
    }
}
