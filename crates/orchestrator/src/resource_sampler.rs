//! C7 `ResourceSampler`: one polling loop per active sandbox, feeding a live
//! snapshot map and sustained-breach durations the `AbuseDetector` rules
//! (spec.md §4.8) evaluate over (spec.md §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use sandbox::{Handle, SandboxDriver};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Fraction of a ceiling at which a sustained breach begins counting,
/// shared by the CPU and memory rules in spec.md §4.8.
const BREACH_THRESHOLD: f64 = 0.90;

/// A live snapshot for one execution, plus how long it has continuously
/// sat above the 90% threshold for CPU and memory. Resets to zero the
/// instant a tick reads back under threshold.
#[derive(Debug, Clone, Copy)]
pub struct ActiveSample {
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    pub pids: u32,
    pub running: bool,
    pub cpu_breach_seconds: f64,
    pub mem_breach_seconds: f64,
}

struct Tracked {
    sample: ActiveSample,
    cpu_breach_since: Option<Instant>,
    mem_breach_since: Option<Instant>,
}

/// Shared across every execution fibre; each fibre spawns its own polling
/// task via [`ResourceSampler::spawn`] but all tasks publish into the same
/// snapshot map so `ActiveList` (spec.md §6.1) can read a consistent view.
pub struct ResourceSampler<D: SandboxDriver> {
    driver: Arc<D>,
    interval: Duration,
    snapshots: Arc<RwLock<HashMap<Uuid, Tracked>>>,
}

impl<D: SandboxDriver + 'static> ResourceSampler<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self::with_interval(driver, DEFAULT_SAMPLE_INTERVAL)
    }

    pub fn with_interval(driver: Arc<D>, interval: Duration) -> Self {
        Self {
            driver,
            interval,
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn snapshot(&self, execution_id: Uuid) -> Option<ActiveSample> {
        self.snapshots
            .read()
            .await
            .get(&execution_id)
            .map(|t| t.sample)
    }

    pub async fn active_execution_ids(&self) -> Vec<Uuid> {
        self.snapshots.read().await.keys().copied().collect()
    }

    /// Spawns the per-sandbox polling loop. Stops on its own when a sample
    /// reports `running = false`, or immediately on `cancel`. Either way the
    /// execution's entry is removed from the snapshot map before returning.
    pub fn spawn(
        &self,
        execution_id: Uuid,
        handle: Handle,
        cpu_limit_pct: f64,
        mem_limit_bytes: u64,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let driver = self.driver.clone();
        let interval = self.interval;
        let snapshots = self.snapshots.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!(%execution_id, "sampler loop cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let sample = match driver.sample(&handle).await {
                            Ok(sample) => sample,
                            Err(err) => {
                                debug!(%execution_id, error = %err, "sample failed, stopping sampler");
                                break;
                            }
                        };

                        let mut guard = snapshots.write().await;
                        let now = Instant::now();
                        let entry = guard.entry(execution_id).or_insert_with(|| Tracked {
                            sample: ActiveSample {
                                cpu_pct: 0.0,
                                mem_bytes: 0,
                                pids: 0,
                                running: true,
                                cpu_breach_seconds: 0.0,
                                mem_breach_seconds: 0.0,
                            },
                            cpu_breach_since: None,
                            mem_breach_since: None,
                        });

                        let cpu_breaching = cpu_limit_pct > 0.0
                            && sample.cpu_pct >= BREACH_THRESHOLD * cpu_limit_pct;
                        entry.cpu_breach_since = if cpu_breaching {
                            Some(entry.cpu_breach_since.unwrap_or(now))
                        } else {
                            None
                        };

                        let mem_breaching = mem_limit_bytes > 0
                            && sample.mem_bytes as f64 >= BREACH_THRESHOLD * mem_limit_bytes as f64;
                        entry.mem_breach_since = if mem_breaching {
                            Some(entry.mem_breach_since.unwrap_or(now))
                        } else {
                            None
                        };

                        entry.sample = ActiveSample {
                            cpu_pct: sample.cpu_pct,
                            mem_bytes: sample.mem_bytes,
                            pids: sample.pids,
                            running: sample.running,
                            cpu_breach_seconds: entry
                                .cpu_breach_since
                                .map(|since| now.duration_since(since).as_secs_f64())
                                .unwrap_or(0.0),
                            mem_breach_seconds: entry
                                .mem_breach_since
                                .map(|since| now.duration_since(since).as_secs_f64())
                                .unwrap_or(0.0),
                        };

                        let still_running = sample.running;
                        drop(guard);
                        if !still_running {
                            break;
                        }
                    }
                }
            }
            snapshots.write().await.remove(&execution_id);
        })
    }
}
