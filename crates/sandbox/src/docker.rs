//! `SandboxDriver` backed by a local container runtime via `bollard`,
//! grounded in the same Docker-API-client shape used for sandboxed command
//! execution elsewhere in the corpus (`SandboxManager` / `ContainerRunner`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::driver::{
    safe_join, ExitOutcome, Handle, Sample, SandboxDriver, StreamEndpoints, TermSignal,
    DEFAULT_OP_DEADLINE,
};
use crate::error::{Result, SandboxError};
use crate::spec::{NetworkPolicy, SandboxSpec};

/// Root of the writable working directory inside every sandbox, matching
/// the catalogue's `VAR_SCRATCH_DIR`/`VAR_ENTRY_FILE` templating.
const WORKDIR: &str = "/workspace";

pub struct BollardSandboxDriver {
    docker: Docker,
    host_dirs_root: PathBuf,
}

impl BollardSandboxDriver {
    /// Connects using the platform default (unix socket on Linux, named pipe
    /// on Windows). `host_dirs_root` is where per-sandbox bind-mount
    /// directories are created on the host.
    pub fn connect(host_dirs_root: impl Into<PathBuf>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::SandboxUnavailable(e.to_string()))?;
        Ok(Self {
            docker,
            host_dirs_root: host_dirs_root.into(),
        })
    }

    async fn ping(&self) -> Result<()> {
        tokio::time::timeout(DEFAULT_OP_DEADLINE, self.docker.ping())
            .await
            .map_err(|_| SandboxError::Timeout(DEFAULT_OP_DEADLINE))?
            .map_err(|e| SandboxError::SandboxUnavailable(e.to_string()))?;
        Ok(())
    }

    fn host_dir_for(&self, handle_id: uuid::Uuid) -> PathBuf {
        self.host_dirs_root.join(handle_id.to_string())
    }
}

#[async_trait]
impl SandboxDriver for BollardSandboxDriver {
    async fn create(&self, spec: &SandboxSpec) -> Result<Handle> {
        self.ping().await?;

        let handle_id = uuid::Uuid::new_v4();
        let host_dir = self.host_dir_for(handle_id);
        tokio::fs::create_dir_all(&host_dir)
            .await
            .map_err(|e| SandboxError::Internal(format!("create workdir: {e}")))?;

        let mut binds = vec![format!("{}:{}:rw", host_dir.display(), WORKDIR)];
        for mount in &spec.extra_mounts {
            let mode = if mount.read_only { "ro" } else { "rw" };
            binds.push(format!("{}:{}:{}", mount.host_path, mount.sandbox_path, mode));
        }

        let network_mode = match spec.network_policy {
            NetworkPolicy::None => "none",
            NetworkPolicy::Allow => "bridge",
        };

        let host_config = HostConfig {
            memory: Some((spec.memory_limit_mb * 1024 * 1024) as i64),
            memory_swap: Some((spec.memory_limit_mb * 1024 * 1024) as i64),
            nano_cpus: Some((spec.cpu_share * 1_000_000_000.0) as i64),
            pids_limit: Some(spec.max_pids as i64),
            binds: Some(binds),
            network_mode: Some(network_mode.to_string()),
            readonly_rootfs: Some(true),
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = Config {
            image: Some(spec.image_ref.clone()),
            working_dir: Some(WORKDIR.to_string()),
            env: Some(env),
            host_config: Some(host_config),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(false),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("exec-{handle_id}"),
            platform: None,
        };

        let created = tokio::time::timeout(
            DEFAULT_OP_DEADLINE,
            self.docker.create_container(Some(options), config),
        )
        .await
        .map_err(|_| SandboxError::Timeout(DEFAULT_OP_DEADLINE))?
        .map_err(|e| SandboxError::SandboxUnavailable(e.to_string()))?;

        debug!(container_id = %created.id, "sandbox container created");
        Ok(Handle::with_id(handle_id, created.id))
    }

    async fn write_file(&self, handle: &Handle, relpath: &str, bytes: Vec<u8>) -> Result<()> {
        if handle.is_destroyed() {
            return Err(SandboxError::NotFound);
        }
        let host_dir = self.host_dir_for(handle.id);
        let dest = safe_join(&host_dir, relpath)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::Internal(format!("mkdir: {e}")))?;
        }
        write_atomic(&dest, &bytes).await
    }

    async fn start(
        &self,
        handle: &Handle,
        stdin_bytes: Vec<u8>,
        run_command: String,
    ) -> Result<StreamEndpoints> {
        if handle.is_destroyed() {
            return Err(SandboxError::NotFound);
        }

        // Run the resolved command via a shell inside the already-created
        // container rather than re-creating it, so `write_file` calls made
        // between `create` and `start` are visible.
        let exec = self
            .docker
            .create_exec(
                &handle.backend_id,
                bollard::exec::CreateExecOptions {
                    cmd: Some(vec!["/bin/sh".to_string(), "-lc".to_string(), run_command]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(WORKDIR.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Internal(format!("create_exec: {e}")))?;

        tokio::time::timeout(
            DEFAULT_OP_DEADLINE,
            self.docker.start_container(
                &handle.backend_id,
                None::<StartContainerOptions<String>>,
            ),
        )
        .await
        .map_err(|_| SandboxError::Timeout(DEFAULT_OP_DEADLINE))?
        .map_err(|e| SandboxError::SandboxUnavailable(e.to_string()))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Internal(format!("start_exec: {e}")))?;

        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(256);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Bytes>(256);
        let (exit_tx, exit_rx) = oneshot::channel();

        if let bollard::exec::StartExecResults::Attached { mut output, mut input } = start_result {
            if !stdin_bytes.is_empty() {
                if let Err(e) = input.write_all(&stdin_bytes).await {
                    warn!(error = %e, "failed writing stdin to sandbox exec");
                }
            }
            drop(input); // close stdin after delivering the bounded buffer

            let exec_id = exec.id.clone();
            let container_id = handle.backend_id.clone();
            let docker = self.docker.clone();
            tokio::spawn(async move {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            let _ = stdout_tx.send(message).await;
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            let _ = stderr_tx.send(message).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "sandbox output stream error");
                            break;
                        }
                    }
                }
                let exit_code = docker
                    .inspect_exec(&exec_id)
                    .await
                    .ok()
                    .and_then(|inspect| inspect.exit_code)
                    .map(|c| c as i32);
                // the exec's own exit code doesn't carry OOM info; that's a
                // property of the container's cgroup, surfaced on its State.
                let oom_killed = docker
                    .inspect_container(&container_id, None)
                    .await
                    .ok()
                    .and_then(|inspect| inspect.state)
                    .and_then(|state| state.oom_killed)
                    .unwrap_or(false);
                let _ = exit_tx.send(ExitOutcome { exit_code, oom_killed });
            });
        } else {
            let _ = exit_tx.send(ExitOutcome {
                exit_code: None,
                oom_killed: false,
            });
        }

        Ok(StreamEndpoints {
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
        })
    }

    async fn sample(&self, handle: &Handle) -> Result<Sample> {
        if handle.is_destroyed() {
            return Err(SandboxError::NotFound);
        }
        let mut stream = self.docker.stats(
            &handle.backend_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let stats = tokio::time::timeout(DEFAULT_OP_DEADLINE, stream.next())
            .await
            .map_err(|_| SandboxError::Timeout(DEFAULT_OP_DEADLINE))?
            .ok_or_else(|| SandboxError::Internal("no stats available".into()))?
            .map_err(|e| SandboxError::Internal(e.to_string()))?;

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
        let cpu_pct = if system_delta > 0.0 {
            (cpu_delta / system_delta) * online_cpus * 100.0
        } else {
            0.0
        };

        let mem_bytes = stats.memory_stats.usage.unwrap_or(0);
        let pids = stats
            .pids_stats
            .current
            .unwrap_or(0) as u32;

        Ok(Sample {
            cpu_pct,
            mem_bytes,
            pids,
            running: true,
        })
    }

    async fn signal(&self, handle: &Handle, signal: TermSignal) -> Result<()> {
        if handle.is_destroyed() {
            return Ok(()); // idempotent
        }
        let unix_signal = match signal {
            TermSignal::Graceful => "SIGTERM",
            TermSignal::Forced => "SIGKILL",
        };
        match self
            .docker
            .kill_container(
                &handle.backend_id,
                Some(KillContainerOptions {
                    signal: unix_signal,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 || status_code == 409 =>
            {
                Ok(()) // already gone or already stopped: idempotent
            }
            Err(e) => Err(SandboxError::Internal(e.to_string())),
        }
    }

    async fn destroy(&self, handle: &Handle) -> Result<()> {
        if handle.is_destroyed() {
            return Ok(());
        }
        let result = self
            .docker
            .remove_container(
                &handle.backend_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;
        handle.mark_destroyed();

        let host_dir = self.host_dir_for(handle.id);
        let _ = tokio::fs::remove_dir_all(&host_dir).await;

        match result {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(SandboxError::Internal(e.to_string())),
        }
    }
}

async fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = dest.with_extension("tmp-write");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| SandboxError::Internal(format!("write temp file: {e}")))?;
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| SandboxError::Internal(format!("rename into place: {e}")))?;
    Ok(())
}
