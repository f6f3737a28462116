//! C5 `Orchestrator`: the per-execution state machine — admit, materialise,
//! launch, stream, terminate, record (spec.md §4.5). Owns cancellation,
//! timeout, and stop, and exposes the transport-agnostic public API of
//! spec.md §6.1.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use catalogue::LanguageCatalogue;
use sandbox::{BlobSync, Handle, NetworkPolicy, SandboxDriver, SandboxSpec, TermSignal};
use store::{
    AuditStore, CachedSettingsStore, ExecutionRecord, ExecutionRecordStore, ExecutionStatus,
    ProfileStore, ProjectStore, PushBus, SettingsStore, TerminalUpdate, TerminationReason,
};

use crate::abuse_detector::{AbuseDetector, EvaluationContext};
use crate::admitter::Admitter;
use crate::error::{OrchestratorError, Result};
use crate::frame::{Frame, FramePayload, StatusValue};
use crate::resource_sampler::ResourceSampler;
use crate::stream_mux::{self, StreamMuxHandle, DEFAULT_RING_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER};

/// Cap on bytes captured per stream before the execution is killed for
/// overflow (spec.md §4.5 step 7, testable property 5). Not part of
/// `Settings` (§6.5); like the concurrency cap, the spec treats it as a
/// deployment constant rather than a per-tenant knob.
pub const DEFAULT_OUTPUT_CAP_BYTES: u64 = 2 * 1024 * 1024;

/// How long a fibre waits after a graceful signal before forcing
/// destruction (spec.md §5 "Cancellation").
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Caller identity for `Stop`/`AdminKill`, used only to decide
/// authorization and the resulting termination reason.
#[derive(Debug, Clone, Copy)]
pub enum Actor {
    User(Uuid),
    Admin(Uuid),
}

impl Actor {
    fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }

    fn authorized_for(&self, owner_id: Uuid) -> bool {
        match self {
            Actor::User(uid) => *uid == owner_id,
            Actor::Admin(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub file_path: String,
    pub language: String,
    pub entry_file_content: Option<Vec<u8>>,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ActiveListEntry {
    pub execution_id: Uuid,
    pub user_id: Uuid,
    pub language: String,
    pub created_at: chrono::DateTime<Utc>,
    pub cpu_pct: Option<f64>,
    pub mem_bytes: Option<u64>,
}

/// In-memory bookkeeping for one running (non-terminal) execution. Lives in
/// the `active` map for exactly as long as its fibre is alive; removed the
/// instant the fibre finalises.
struct LiveExecution {
    user_id: Uuid,
    language: String,
    created_at: chrono::DateTime<Utc>,
    cancel: CancellationToken,
    mux: StreamMuxHandle,
    requested_reason: OnceLock<TerminationReason>,
}

pub struct Orchestrator<D, P, J, E, S, A, PB>
where
    D: SandboxDriver + 'static,
    P: ProfileStore + 'static,
    J: ProjectStore + 'static,
    E: ExecutionRecordStore + 'static,
    S: SettingsStore + 'static,
    A: AuditStore + 'static,
    PB: PushBus + 'static,
{
    catalogue: Arc<LanguageCatalogue>,
    driver: Arc<D>,
    blob_sync: Arc<BlobSync>,
    admitter: Arc<Admitter<P, J, E, S>>,
    profiles: Arc<P>,
    executions: Arc<E>,
    settings: Arc<CachedSettingsStore<S>>,
    audit: Arc<A>,
    push_bus: Arc<PB>,
    resource_sampler: Arc<ResourceSampler<D>>,
    abuse_detector: Arc<AbuseDetector<P, A>>,
    active: Arc<RwLock<HashMap<Uuid, Arc<LiveExecution>>>>,
    scratch_root: PathBuf,
    seq_counter: Arc<AtomicU64>,
}

impl<D, P, J, E, S, A, PB> Orchestrator<D, P, J, E, S, A, PB>
where
    D: SandboxDriver + 'static,
    P: ProfileStore + 'static,
    J: ProjectStore + 'static,
    E: ExecutionRecordStore + 'static,
    S: SettingsStore + 'static,
    A: AuditStore + 'static,
    PB: PushBus + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalogue: Arc<LanguageCatalogue>,
        driver: Arc<D>,
        blob_sync: Arc<BlobSync>,
        admitter: Arc<Admitter<P, J, E, S>>,
        profiles: Arc<P>,
        executions: Arc<E>,
        settings: Arc<CachedSettingsStore<S>>,
        audit: Arc<A>,
        push_bus: Arc<PB>,
        scratch_root: PathBuf,
    ) -> Self {
        let resource_sampler = Arc::new(ResourceSampler::new(driver.clone()));
        let abuse_detector = Arc::new(AbuseDetector::new(profiles.clone(), audit.clone()));
        Self {
            catalogue,
            driver,
            blob_sync,
            admitter,
            profiles,
            executions,
            settings,
            audit,
            push_bus,
            resource_sampler,
            abuse_detector,
            active: Arc::new(RwLock::new(HashMap::new())),
            scratch_root,
            seq_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// spec.md §6.1 `Run`.
    pub async fn run(&self, req: RunRequest) -> Result<Uuid> {
        let entry = self.catalogue.get(&req.language)?.clone();
        let admission = self
            .admitter
            .admit(req.user_id, req.project_id, &req.language)
            .await?;

        let execution_id = Uuid::new_v4();
        let record = ExecutionRecord::new(
            execution_id,
            req.user_id,
            req.project_id,
            req.language.clone(),
            req.file_path.clone(),
        );
        self.executions.insert(record).await?;

        let mux = stream_mux::spawn(DEFAULT_RING_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER);
        let cancel = CancellationToken::new();
        let live = Arc::new(LiveExecution {
            user_id: req.user_id,
            language: req.language.clone(),
            created_at: Utc::now(),
            cancel: cancel.clone(),
            mux: mux.clone(),
            requested_reason: OnceLock::new(),
        });
        self.active.write().await.insert(execution_id, live.clone());
        mux.publish(FramePayload::Status { value: StatusValue::Queued }).await;

        self.spawn_abuse_watch(execution_id, req.user_id, cancel.clone());

        let fibre = FibreContext {
            execution_id,
            req,
            entry,
            admission,
            catalogue: self.catalogue.clone(),
            driver: self.driver.clone(),
            blob_sync: self.blob_sync.clone(),
            executions: self.executions.clone(),
            settings: self.settings.clone(),
            push_bus: self.push_bus.clone(),
            resource_sampler: self.resource_sampler.clone(),
            active: self.active.clone(),
            scratch_root: self.scratch_root.clone(),
            mux,
            cancel,
            live,
        };
        tokio::spawn(fibre.run());

        Ok(execution_id)
    }

    /// spec.md §6.1 `Stop` / `AdminKill`. Idempotent: a terminal execution
    /// returns its persisted status without error.
    pub async fn stop(&self, execution_id: Uuid, actor: Actor) -> Result<ExecutionStatus> {
        let live = self.active.read().await.get(&execution_id).cloned();
        let Some(live) = live else {
            let record = self.executions.get(execution_id).await?;
            if !actor.authorized_for(record.user_id) {
                return Err(OrchestratorError::Forbidden);
            }
            return Ok(record.status);
        };

        if !actor.authorized_for(live.user_id) {
            return Err(OrchestratorError::Forbidden);
        }

        let reason = if actor.is_admin() {
            TerminationReason::KilledAdmin
        } else {
            TerminationReason::Stopped
        };
        // first caller to set the reason wins; later callers observe the
        // same committed reason, giving exactly-once semantics.
        let _ = live.requested_reason.set(reason);
        live.cancel.cancel();

        Ok(match live.requested_reason.get().copied().unwrap_or(reason) {
            TerminationReason::KilledAdmin => ExecutionStatus::KilledAdmin,
            _ => ExecutionStatus::Stopped,
        })
    }

    pub async fn admin_kill(&self, execution_id: Uuid, admin_user_id: Uuid) -> Result<ExecutionStatus> {
        self.stop(execution_id, Actor::Admin(admin_user_id)).await
    }

    /// spec.md §6.1 `Status`.
    pub async fn status(&self, execution_id: Uuid) -> Result<ExecutionRecord> {
        self.executions.get(execution_id).await.map_err(Into::into)
    }

    /// spec.md §6.1 `Subscribe`. A subscriber attaching after finalisation
    /// receives a single synthetic `Ended` frame (spec.md §5 "Ordering
    /// guarantees").
    pub async fn subscribe(
        &self,
        execution_id: Uuid,
        from_seq: Option<u64>,
    ) -> Result<mpsc::Receiver<Frame>> {
        if let Some(live) = self.active.read().await.get(&execution_id).cloned() {
            if let Some(rx) = live.mux.subscribe(from_seq).await {
                return Ok(rx);
            }
        }

        // Either never in the active map or the mux actor already exited:
        // reconstruct a single terminal frame from the persisted record.
        let record = self.executions.get(execution_id).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx
            .send(Frame {
                seq: 0,
                timestamp: record.ended_at.unwrap_or_else(Utc::now),
                payload: FramePayload::Status { value: StatusValue::Ended },
            })
            .await;
        Ok(rx)
    }

    /// spec.md §6.1 `ActiveList`.
    pub async fn active_list(&self) -> Vec<ActiveListEntry> {
        let guard = self.active.read().await;
        let mut out = Vec::with_capacity(guard.len());
        for (execution_id, live) in guard.iter() {
            let sample = self.resource_sampler.snapshot(*execution_id).await;
            out.push(ActiveListEntry {
                execution_id: *execution_id,
                user_id: live.user_id,
                language: live.language.clone(),
                created_at: live.created_at,
                cpu_pct: sample.map(|s| s.cpu_pct),
                mem_bytes: sample.map(|s| s.mem_bytes),
            });
        }
        out
    }

    /// Boot-time reconciliation sweep (spec.md §5 "Crash recovery"): marks
    /// orphaned non-terminal records `crashed`. Destroying sandboxes older
    /// than `container_cleanup_hours` is the sandbox driver's
    /// responsibility at the infrastructure layer; this sweep only repairs
    /// the record store, since a freshly-started process holds no sandbox
    /// handles from a prior run.
    pub async fn reconcile(&self) -> Result<usize> {
        let orphaned = self.executions.non_terminal().await?;
        let mut repaired = 0;
        for record in orphaned {
            warn!(execution_id = %record.id, "reconciling orphaned execution as crashed");
            self.executions
                .update_terminal(
                    record.id,
                    TerminalUpdate {
                        status: ExecutionStatus::Crashed,
                        exit_code: None,
                        execution_time_ms: None,
                        memory_used_mb: None,
                        stdout_bytes: record.stdout_bytes,
                        stderr_bytes: record.stderr_bytes,
                        truncated_stdout: record.truncated_stdout,
                        truncated_stderr: record.truncated_stderr,
                        termination_reason: TerminationReason::Crashed,
                        ended_at: Utc::now(),
                    },
                )
                .await?;
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Periodically feeds the `ResourceSampler`'s live breach durations and
    /// the record store's rolling counters into the `AbuseDetector` for as
    /// long as the execution runs (spec.md §4.7 "feeds the abuse detector",
    /// §4.8). Stops with the execution's cancellation token; independent of
    /// the fibre so a detector failure never affects the run itself.
    fn spawn_abuse_watch(&self, execution_id: Uuid, user_id: Uuid, cancel: CancellationToken) {
        let resource_sampler = self.resource_sampler.clone();
        let abuse_detector = self.abuse_detector.clone();
        let executions = self.executions.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(sample) = resource_sampler.snapshot(execution_id).await else {
                            continue;
                        };
                        let snapshot = match settings.snapshot().await {
                            Ok(s) => s,
                            Err(_) => continue,
                        };
                        let count_in_hour = executions.count_in_hour(user_id).await.unwrap_or(0);
                        let recent = executions.recent(user_id, 20).await.unwrap_or_default();
                        let ctx = EvaluationContext {
                            user_id,
                            cpu_breach_seconds: sample.cpu_breach_seconds,
                            mem_breach_seconds: sample.mem_breach_seconds,
                            executions_in_last_hour: count_in_hour,
                            hourly_limit: snapshot.max_executions_per_hour,
                            recent: &recent,
                        };
                        let alerts = abuse_detector.observe(ctx, snapshot.auto_block_on_abuse).await;
                        for alert in &alerts {
                            warn!(%user_id, rule = alert.rule.as_str(), ?alert.severity, "abuse rule triggered");
                        }
                    }
                }
            }
        });
    }
}

/// Everything one execution's fibre needs, owned exclusively by it.
struct FibreContext<D, E, S, PB>
where
    D: SandboxDriver + 'static,
    E: ExecutionRecordStore + 'static,
    S: SettingsStore + 'static,
    PB: PushBus + 'static,
{
    execution_id: Uuid,
    req: RunRequest,
    entry: catalogue::LanguageEntry,
    admission: crate::admitter::Admission,
    catalogue: Arc<LanguageCatalogue>,
    driver: Arc<D>,
    blob_sync: Arc<BlobSync>,
    executions: Arc<E>,
    settings: Arc<CachedSettingsStore<S>>,
    push_bus: Arc<PB>,
    resource_sampler: Arc<ResourceSampler<D>>,
    active: Arc<RwLock<HashMap<Uuid, Arc<LiveExecution>>>>,
    scratch_root: PathBuf,
    mux: StreamMuxHandle,
    cancel: CancellationToken,
    live: Arc<LiveExecution>,
}

impl<D, E, S, PB> FibreContext<D, E, S, PB>
where
    D: SandboxDriver + 'static,
    E: ExecutionRecordStore + 'static,
    S: SettingsStore + 'static,
    PB: PushBus + 'static,
{
    async fn run(self) {
        let execution_id = self.execution_id;
        let outcome = self.run_inner().await;
        if let Err(err) = &outcome {
            error!(%execution_id, error = %err, "execution setup failed");
            self.mux
                .publish(FramePayload::Status { value: StatusValue::Error })
                .await;
            let _ = self
                .executions
                .update_terminal(
                    execution_id,
                    TerminalUpdate {
                        status: ExecutionStatus::SetupFailed,
                        exit_code: None,
                        execution_time_ms: None,
                        memory_used_mb: None,
                        stdout_bytes: 0,
                        stderr_bytes: 0,
                        truncated_stdout: false,
                        truncated_stderr: false,
                        termination_reason: TerminationReason::SetupFailed,
                        ended_at: Utc::now(),
                    },
                )
                .await;
        }
        self.active.write().await.remove(&execution_id);
        // admission token is released here via `self.admission`'s drop
    }

    async fn run_inner(mut self) -> Result<()> {
        let execution_id = self.execution_id;
        let settings = self.settings.snapshot().await?;

        // Preparing: materialise the project into a scratch workdir.
        let workdir = self.scratch_root.join(execution_id.to_string());
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| OrchestratorError::SetupFailed(format!("mkdir scratch dir: {e}")))?;
        let project_prefix = format!("{}/", self.req.project_id);
        self.blob_sync
            .pull(&project_prefix, &workdir, &self.cancel)
            .await
            .map_err(OrchestratorError::from)?;

        // Launching: build the spec, create and seed the sandbox.
        let spec = SandboxSpec {
            image_ref: self.entry.image_ref.clone(),
            cpu_share: settings.max_cpu_percent as f64 / 100.0,
            memory_limit_mb: settings.max_memory_mb,
            max_pids: 64,
            network_policy: if self.entry.allow_network {
                NetworkPolicy::Allow
            } else {
                NetworkPolicy::None
            },
            env: HashMap::new(),
            extra_mounts: Vec::new(),
        };
        let handle = self.driver.create(&spec).await?;

        if let Some(content) = self.req.entry_file_content.take() {
            self.driver
                .write_file(&handle, &self.req.file_path, content)
                .await?;
        }

        let run_command = self.entry.rendered_run_command(&self.req.file_path, ".scratch");
        let stdin_bytes = self.req.stdin.clone().unwrap_or_default();
        let mut endpoints = match self.driver.start(&handle, stdin_bytes, run_command).await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                let _ = self.driver.destroy(&handle).await;
                return Err(err.into());
            }
        };

        self.mux
            .publish(FramePayload::Status { value: StatusValue::Running })
            .await;

        self.resource_sampler.spawn(
            execution_id,
            handle.clone(),
            settings.max_cpu_percent as f64,
            settings.max_memory_mb * 1024 * 1024,
            self.cancel.clone(),
        );

        let started_at = Utc::now();
        let output_cap = DEFAULT_OUTPUT_CAP_BYTES;
        let mut stdout_bytes: u64 = 0;
        let mut stderr_bytes: u64 = 0;
        let mut truncated_stdout = false;
        let mut truncated_stderr = false;

        let timeout = tokio::time::sleep(Duration::from_secs(settings.max_runtime_seconds));
        tokio::pin!(timeout);

        let exit_outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    break None;
                }
                _ = &mut timeout => {
                    break None;
                }
                chunk = endpoints.stdout.recv(), if stdout_bytes < output_cap => {
                    match chunk {
                        Some(bytes) => {
                            let remaining = output_cap - stdout_bytes;
                            let bytes = if bytes.len() as u64 > remaining {
                                truncated_stdout = true;
                                let _ = self.live.requested_reason.set(TerminationReason::Stopped);
                                self.cancel.cancel();
                                bytes.slice(0..remaining as usize)
                            } else {
                                bytes
                            };
                            stdout_bytes += bytes.len() as u64;
                            self.publish_chunk(bytes, false).await;
                        }
                        None => {}
                    }
                }
                chunk = endpoints.stderr.recv(), if stderr_bytes < output_cap => {
                    match chunk {
                        Some(bytes) => {
                            let remaining = output_cap - stderr_bytes;
                            let bytes = if bytes.len() as u64 > remaining {
                                truncated_stderr = true;
                                let _ = self.live.requested_reason.set(TerminationReason::Stopped);
                                self.cancel.cancel();
                                bytes.slice(0..remaining as usize)
                            } else {
                                bytes
                            };
                            stderr_bytes += bytes.len() as u64;
                            self.publish_chunk(bytes, true).await;
                        }
                        None => {}
                    }
                }
                exit = &mut endpoints.exit => {
                    break exit.ok();
                }
            }
        };

        // priority: timeout > stop/admin-kill > OOM > crash > completed
        let requested = self.live.requested_reason.get().copied();
        let timed_out = timeout.is_elapsed() && exit_outcome.is_none() && requested.is_none();

        let (status, reason) = if timed_out && requested.is_none() {
            (ExecutionStatus::Timeout, TerminationReason::Timeout)
        } else if let Some(reason) = requested {
            let status = match reason {
                TerminationReason::KilledAdmin => ExecutionStatus::KilledAdmin,
                _ => ExecutionStatus::Stopped,
            };
            (status, reason)
        } else if let Some(outcome) = exit_outcome {
            if outcome.oom_killed {
                (ExecutionStatus::OutOfMemory, TerminationReason::OutOfMemory)
            } else if outcome.exit_code == Some(0) {
                (ExecutionStatus::Completed, TerminationReason::Completed)
            } else {
                (ExecutionStatus::Crashed, TerminationReason::Crashed)
            }
        } else {
            // cancelled with no requested reason and no exit outcome before
            // the wall-clock timer elapsed: shouldn't happen given the
            // cancellation sources above (stop/admin-kill/overflow all set
            // `requested_reason` before cancelling), kept as a conservative
            // fallback rather than a panic.
            (ExecutionStatus::Timeout, TerminationReason::Timeout)
        };

        // graceful, then forced after the grace period
        let _ = self.driver.signal(&handle, TermSignal::Graceful).await;
        tokio::select! {
            _ = tokio::time::sleep(GRACE_PERIOD) => {
                let _ = self.driver.signal(&handle, TermSignal::Forced).await;
            }
            _ = drain_remaining(&mut endpoints) => {}
        }

        let status_value = match status {
            ExecutionStatus::Completed => StatusValue::Completed,
            ExecutionStatus::Timeout => StatusValue::Timeout,
            ExecutionStatus::Stopped | ExecutionStatus::KilledAdmin => StatusValue::Stopped,
            _ => StatusValue::Error,
        };
        self.mux
            .publish(FramePayload::Status { value: status_value })
            .await;

        let exit_code = exit_outcome.and_then(|o| o.exit_code);
        let ended_at = Utc::now();
        self.executions
            .update_terminal(
                execution_id,
                TerminalUpdate {
                    status,
                    exit_code,
                    execution_time_ms: Some((ended_at - started_at).num_milliseconds()),
                    memory_used_mb: self
                        .resource_sampler
                        .snapshot(execution_id)
                        .await
                        .map(|s| s.mem_bytes / (1024 * 1024)),
                    stdout_bytes,
                    stderr_bytes,
                    truncated_stdout,
                    truncated_stderr,
                    termination_reason: reason,
                    ended_at,
                },
            )
            .await?;

        self.driver
            .destroy(&handle)
            .await
            .map_err(OrchestratorError::from)?;

        self.push_bus
            .publish(
                &format!("execution/{execution_id}"),
                serde_json::json!({ "status": status_value_str(status_value) }),
            )
            .await
            .map_err(|e| debug!(%execution_id, error = %e, "push bus publish failed"))
            .ok();

        info!(%execution_id, ?status, "execution finalised");
        Ok(())
    }

    async fn publish_chunk(&self, bytes: Bytes, is_stderr: bool) {
        let payload = if is_stderr {
            FramePayload::Stderr { bytes: bytes.to_vec() }
        } else {
            FramePayload::Stdout { bytes: bytes.to_vec() }
        };
        self.mux.publish(payload).await;
    }
}

async fn drain_remaining(endpoints: &mut sandbox::StreamEndpoints) {
    loop {
        tokio::select! {
            chunk = endpoints.stdout.recv() => if chunk.is_none() { break; },
            chunk = endpoints.stderr.recv() => if chunk.is_none() { break; },
            else => break,
        }
    }
}

fn status_value_str(value: StatusValue) -> &'static str {
    match value {
        StatusValue::Queued => "queued",
        StatusValue::Running => "running",
        StatusValue::Completed => "completed",
        StatusValue::Error => "error",
        StatusValue::Timeout => "timeout",
        StatusValue::Stopped => "stopped",
        StatusValue::SubscriberLagged => "subscriber_lagged",
        StatusValue::Ended => "ended",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_stream::StreamExt;

    use sandbox::{ExitOutcome, Sample, StreamEndpoints};
    use store::{
        InMemoryAuditStore, InMemoryBlobStore, InMemoryExecutionRecordStore, InMemoryProfileStore,
        InMemoryProjectStore, InMemoryPushBus, InMemorySettingsStore, Profile, Project, Role,
        Settings, UserStatus,
    };

    use super::*;
    use crate::admitter::Admitter;

    /// Scripted behavior a fake sandbox "runs", standing in for a real
    /// container for orchestrator-level tests (spec.md §8 S1-S5).
    #[derive(Clone)]
    enum Script {
        /// Emits the given bytes on each stream, then exits.
        Complete {
            stdout: Vec<u8>,
            stderr: Vec<u8>,
            exit_code: i32,
        },
        /// Never exits on its own; only reacts to the orchestrator's own
        /// cancellation/timeout, standing in for `while True: pass` (S2)
        /// and `sleep(60)` (S3).
        Hang,
        /// Keeps emitting `chunk` on stdout `count` times without ever
        /// exiting, for the output-overflow scenario (S5).
        Overflow { chunk: Vec<u8>, count: usize },
    }

    struct FakeDriver {
        script: Script,
        signals: tokio::sync::Mutex<Vec<TermSignal>>,
        destroyed: std::sync::atomic::AtomicBool,
    }

    impl FakeDriver {
        fn new(script: Script) -> Self {
            Self {
                script,
                signals: tokio::sync::Mutex::new(Vec::new()),
                destroyed: std::sync::atomic::AtomicBool::new(false),
            }
        }

        async fn signals_seen(&self) -> Vec<TermSignal> {
            self.signals.lock().await.clone()
        }
    }

    #[async_trait]
    impl SandboxDriver for FakeDriver {
        async fn create(&self, _spec: &SandboxSpec) -> sandbox::Result<Handle> {
            Ok(Handle::new("fake-container"))
        }

        async fn write_file(&self, _handle: &Handle, _relpath: &str, _bytes: Vec<u8>) -> sandbox::Result<()> {
            Ok(())
        }

        async fn start(
            &self,
            _handle: &Handle,
            _stdin_bytes: Vec<u8>,
            _run_command: String,
        ) -> sandbox::Result<StreamEndpoints> {
            let (stdout_tx, stdout_rx) = mpsc::channel(64);
            let (stderr_tx, stderr_rx) = mpsc::channel(64);
            let (exit_tx, exit_rx) = oneshot::channel();
            let script = self.script.clone();

            tokio::spawn(async move {
                match script {
                    Script::Complete { stdout, stderr, exit_code } => {
                        if !stdout.is_empty() {
                            let _ = stdout_tx.send(Bytes::from(stdout)).await;
                        }
                        if !stderr.is_empty() {
                            let _ = stderr_tx.send(Bytes::from(stderr)).await;
                        }
                        drop(stdout_tx);
                        drop(stderr_tx);
                        let _ = exit_tx.send(ExitOutcome {
                            exit_code: Some(exit_code),
                            oom_killed: false,
                        });
                    }
                    Script::Hang => {
                        // outlives every test's timeout/grace-period window;
                        // the test ends (and aborts this task) long before.
                        tokio::time::sleep(StdDuration::from_secs(60)).await;
                        let _ = exit_tx.send(ExitOutcome { exit_code: Some(0), oom_killed: false });
                    }
                    Script::Overflow { chunk, count } => {
                        for _ in 0..count {
                            if stdout_tx.send(Bytes::from(chunk.clone())).await.is_err() {
                                break;
                            }
                        }
                        tokio::time::sleep(StdDuration::from_secs(60)).await;
                        let _ = exit_tx.send(ExitOutcome { exit_code: Some(0), oom_killed: false });
                    }
                }
            });

            Ok(StreamEndpoints {
                stdout: stdout_rx,
                stderr: stderr_rx,
                exit: exit_rx,
            })
        }

        async fn sample(&self, _handle: &Handle) -> sandbox::Result<Sample> {
            Ok(Sample {
                cpu_pct: 1.0,
                mem_bytes: 1024 * 1024,
                pids: 1,
                running: true,
            })
        }

        async fn signal(&self, _handle: &Handle, signal: TermSignal) -> sandbox::Result<()> {
            self.signals.lock().await.push(signal);
            Ok(())
        }

        async fn destroy(&self, _handle: &Handle) -> sandbox::Result<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    type TestOrchestrator = Orchestrator<
        FakeDriver,
        InMemoryProfileStore,
        InMemoryProjectStore,
        InMemoryExecutionRecordStore,
        InMemorySettingsStore,
        InMemoryAuditStore,
        InMemoryPushBus,
    >;

    async fn make_orchestrator(
        script: Script,
        settings: Settings,
        concurrency_limit: usize,
    ) -> (TestOrchestrator, Arc<FakeDriver>, Uuid, Uuid) {
        let user_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();

        let profiles = Arc::new(InMemoryProfileStore::new());
        profiles
            .seed(Profile {
                user_id,
                email: "dev@example.com".into(),
                role: Role::User,
                status: UserStatus::Active,
                storage_used_mb: 0,
                block_reason: None,
            })
            .await;

        let projects = Arc::new(InMemoryProjectStore::new());
        projects
            .seed(Project {
                project_id,
                owner_id: user_id,
                github_url: None,
            })
            .await;

        let executions = Arc::new(InMemoryExecutionRecordStore::new());
        let settings_store = Arc::new(CachedSettingsStore::with_default_ttl(
            InMemorySettingsStore::new(settings),
        ));
        let admitter = Arc::new(Admitter::with_concurrency_limit(
            profiles.clone(),
            projects.clone(),
            executions.clone(),
            settings_store.clone(),
            concurrency_limit,
        ));

        let driver = Arc::new(FakeDriver::new(script));
        let blob_sync = Arc::new(BlobSync::new(Arc::new(InMemoryBlobStore::new())));
        let audit = Arc::new(InMemoryAuditStore::new());
        let push_bus = Arc::new(InMemoryPushBus::new());
        let scratch_root = std::env::temp_dir().join(format!("orchestrator-test-{}", Uuid::new_v4()));

        let orchestrator = Orchestrator::new(
            Arc::new(LanguageCatalogue::with_builtin_defaults()),
            driver.clone(),
            blob_sync,
            admitter,
            profiles,
            executions,
            settings_store,
            audit,
            push_bus,
            scratch_root,
        );

        (orchestrator, driver, user_id, project_id)
    }

    fn request(user_id: Uuid, project_id: Uuid) -> RunRequest {
        RunRequest {
            user_id,
            project_id,
            file_path: "main.py".into(),
            language: "python".into(),
            entry_file_content: None,
            stdin: None,
        }
    }

    /// Polls `Status` until the record reaches a terminal state, since the
    /// terminal stream frame and the record commit are two separate awaits
    /// inside the fibre (the frame is published first) — see spec.md §8
    /// property 3, which only requires the sandbox destroyed *before* the
    /// record commits, not before the frame is sent.
    async fn wait_for_terminal(
        orchestrator: &TestOrchestrator,
        execution_id: Uuid,
        timeout: StdDuration,
    ) -> ExecutionRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = orchestrator.status(execution_id).await.unwrap();
            if record.status.is_terminal() {
                return record;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("execution {execution_id} did not reach a terminal state in time");
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    }

    // S1: happy path — `print("ok")` completes with exit 0 and the expected
    // frame sequence.
    #[tokio::test]
    async fn s1_happy_path_completes_and_streams_expected_frames() {
        let (orchestrator, _driver, user_id, project_id) = make_orchestrator(
            Script::Complete {
                stdout: b"ok\n".to_vec(),
                stderr: Vec::new(),
                exit_code: 0,
            },
            Settings::default(),
            3,
        )
        .await;

        let execution_id = orchestrator.run(request(user_id, project_id)).await.unwrap();
        let rx = orchestrator.subscribe(execution_id, None).await.unwrap();
        let frames: Vec<Frame> = ReceiverStream::new(rx).collect().await;

        let payload_kinds: Vec<String> = frames
            .iter()
            .map(|f| match &f.payload {
                FramePayload::Status { value } => format!("status:{}", status_value_str(*value)),
                FramePayload::Stdout { bytes } => format!("stdout:{}", String::from_utf8_lossy(bytes)),
                FramePayload::Stderr { bytes } => format!("stderr:{}", String::from_utf8_lossy(bytes)),
            })
            .collect();
        assert_eq!(
            payload_kinds,
            vec!["status:queued", "status:running", "stdout:ok\n", "status:completed"]
        );
        let seqs: Vec<u64> = frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);

        let record = wait_for_terminal(&orchestrator, execution_id, StdDuration::from_secs(2)).await;
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.stdout_bytes, 3);
        assert!(!record.truncated_stdout);
    }

    // S2: `while True: pass` with max_runtime_seconds=2 times out within
    // 4s and carries a nonzero/null exit code.
    #[tokio::test]
    async fn s2_wall_clock_timeout_fires_and_destroys_sandbox() {
        let mut settings = Settings::default();
        settings.max_runtime_seconds = 1;
        let (orchestrator, driver, user_id, project_id) =
            make_orchestrator(Script::Hang, settings, 3).await;

        let execution_id = orchestrator.run(request(user_id, project_id)).await.unwrap();
        let record = wait_for_terminal(&orchestrator, execution_id, StdDuration::from_secs(5)).await;

        assert_eq!(record.status, ExecutionStatus::Timeout);
        assert_eq!(record.termination_reason, Some(TerminationReason::Timeout));
        assert!(record.exit_code.is_none());
        assert!(driver.destroyed.load(Ordering::SeqCst));
        assert!(driver.signals_seen().await.contains(&TermSignal::Graceful));
    }

    // S3: owner stop on a long-running program; a second `Stop` is a no-op
    // that returns the same terminal state.
    #[tokio::test]
    async fn s3_owner_stop_is_idempotent() {
        let (orchestrator, driver, user_id, project_id) =
            make_orchestrator(Script::Hang, Settings::default(), 3).await;

        let execution_id = orchestrator.run(request(user_id, project_id)).await.unwrap();
        // give the fibre a moment to reach Running before stopping it.
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let first = orchestrator.stop(execution_id, Actor::User(user_id)).await.unwrap();
        assert_eq!(first, ExecutionStatus::Stopped);

        let record = wait_for_terminal(&orchestrator, execution_id, StdDuration::from_secs(2)).await;
        assert_eq!(record.status, ExecutionStatus::Stopped);
        assert_eq!(record.termination_reason, Some(TerminationReason::Stopped));

        let second = orchestrator.stop(execution_id, Actor::User(user_id)).await.unwrap();
        assert_eq!(second, ExecutionStatus::Stopped);
        assert!(driver.destroyed.load(Ordering::SeqCst));
    }

    // S3 variant: a non-owner, non-admin Stop is rejected.
    #[tokio::test]
    async fn stop_by_non_owner_is_forbidden() {
        let (orchestrator, _driver, user_id, project_id) =
            make_orchestrator(Script::Hang, Settings::default(), 3).await;
        let execution_id = orchestrator.run(request(user_id, project_id)).await.unwrap();

        let intruder = Uuid::new_v4();
        let result = orchestrator.stop(execution_id, Actor::User(intruder)).await;
        assert!(matches!(result, Err(OrchestratorError::Forbidden)));

        // clean up so the test doesn't leak a hung fibre past its scope.
        let _ = orchestrator.stop(execution_id, Actor::Admin(Uuid::new_v4())).await;
    }

    // S4: per-user concurrency cap of 1 rejects a second concurrent Run
    // while the first is still in flight.
    #[tokio::test]
    async fn s4_second_concurrent_run_is_rejected() {
        let (orchestrator, _driver, user_id, project_id) =
            make_orchestrator(Script::Hang, Settings::default(), 1).await;

        let first = orchestrator.run(request(user_id, project_id)).await;
        assert!(first.is_ok());

        let second = orchestrator.run(request(user_id, project_id)).await;
        assert!(matches!(second, Err(OrchestratorError::TooManyConcurrent)));

        // clean up the still-running first execution.
        let _ = orchestrator
            .stop(first.unwrap(), Actor::Admin(Uuid::new_v4()))
            .await;
    }

    // S5: a program that keeps writing past the per-stream cap is
    // truncated and terminated with `truncated_stdout` set, within the
    // grace period of the overflow being detected.
    #[tokio::test]
    async fn s5_output_overflow_truncates_and_stops() {
        let (orchestrator, _driver, user_id, project_id) = make_orchestrator(
            Script::Overflow {
                chunk: vec![b'x'; 700_000],
                count: 6,
            },
            Settings::default(),
            3,
        )
        .await;

        let execution_id = orchestrator.run(request(user_id, project_id)).await.unwrap();
        let record = wait_for_terminal(&orchestrator, execution_id, StdDuration::from_secs(5)).await;

        assert!(record.truncated_stdout);
        assert!(record.stdout_bytes <= DEFAULT_OUTPUT_CAP_BYTES);
        assert!(matches!(
            record.status,
            ExecutionStatus::Stopped | ExecutionStatus::Crashed
        ));
    }

    // A subscriber that attaches after finalisation gets a single synthetic
    // `Ended` frame reconstructed from the persisted record (spec.md §5).
    #[tokio::test]
    async fn late_subscriber_gets_synthetic_ended_frame() {
        let (orchestrator, _driver, user_id, project_id) = make_orchestrator(
            Script::Complete {
                stdout: b"ok\n".to_vec(),
                stderr: Vec::new(),
                exit_code: 0,
            },
            Settings::default(),
            3,
        )
        .await;

        let execution_id = orchestrator.run(request(user_id, project_id)).await.unwrap();
        let _ = wait_for_terminal(&orchestrator, execution_id, StdDuration::from_secs(2)).await;
        // allow the mux actor to fully exit after the terminal frame.
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let mut rx = orchestrator.subscribe(execution_id, None).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(matches!(
            frame.payload,
            FramePayload::Status { value: StatusValue::Ended }
        ));
        assert!(rx.recv().await.is_none());
    }

    // Unsupported language fails admission before any sandbox is touched.
    #[tokio::test]
    async fn run_with_unsupported_language_is_rejected() {
        let (orchestrator, _driver, user_id, project_id) =
            make_orchestrator(Script::Hang, Settings::default(), 3).await;

        let mut req = request(user_id, project_id);
        req.language = "cobol".into();
        let result = orchestrator.run(req).await;
        assert!(matches!(result, Err(OrchestratorError::UnsupportedLanguage(_))));
    }

    // Boot-time reconciliation marks a non-terminal record left behind by a
    // crash as `crashed` (spec.md §5 "Crash recovery").
    #[tokio::test]
    async fn reconcile_marks_orphaned_record_crashed() {
        let (orchestrator, _driver, user_id, project_id) =
            make_orchestrator(Script::Hang, Settings::default(), 3).await;

        let execution_id = Uuid::new_v4();
        let record = ExecutionRecord::new(
            execution_id,
            user_id,
            project_id,
            "python".into(),
            "main.py".into(),
        );
        orchestrator.executions.insert(record).await.unwrap();

        let repaired = orchestrator.reconcile().await.unwrap();
        assert_eq!(repaired, 1);

        let record = orchestrator.status(execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Crashed);
        assert_eq!(record.termination_reason, Some(TerminationReason::Crashed));
    }
}
