//! C8 `AbuseDetector`: thresholded rule evaluation over sampled metrics and
//! historical counts (spec.md §4.8). The rule evaluation itself is a pure
//! function over its inputs; the surrounding `AbuseDetector` type adds the
//! one piece of state the spec calls for — per-`(user, rule)` alert
//! idempotency within a 10-minute window — plus the auto-block side effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use store::{AuditEvent, AuditStore, ExecutionRecord, ExecutionStatus, ProfileStore};

pub const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleId {
    CpuSustained,
    MemorySustained,
    HourlyRate,
    FailureRatio,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::CpuSustained => "cpu-sustained",
            RuleId::MemorySustained => "memory-sustained",
            RuleId::HourlyRate => "hourly-rate",
            RuleId::FailureRatio => "failure-ratio",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub user_id: Uuid,
    pub rule: RuleId,
    pub severity: Severity,
    pub detail: serde_json::Value,
}

/// Everything a rule pass needs for one user; gathered by the caller from
/// the `ResourceSampler` snapshot and `ExecutionRecordStore`.
pub struct EvaluationContext<'a> {
    pub user_id: Uuid,
    pub cpu_breach_seconds: f64,
    pub mem_breach_seconds: f64,
    pub executions_in_last_hour: u32,
    pub hourly_limit: u32,
    /// Most recent executions, newest first, at most 20.
    pub recent: &'a [ExecutionRecord],
}

/// Pure rule evaluation — spec.md §4.8's four rules, each independent.
pub fn evaluate(ctx: &EvaluationContext<'_>) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if ctx.cpu_breach_seconds >= 120.0 {
        alerts.push(Alert {
            user_id: ctx.user_id,
            rule: RuleId::CpuSustained,
            severity: Severity::Critical,
            detail: json!({ "cpu_breach_seconds": ctx.cpu_breach_seconds }),
        });
    } else if ctx.cpu_breach_seconds >= 30.0 {
        alerts.push(Alert {
            user_id: ctx.user_id,
            rule: RuleId::CpuSustained,
            severity: Severity::Warning,
            detail: json!({ "cpu_breach_seconds": ctx.cpu_breach_seconds }),
        });
    }

    if ctx.mem_breach_seconds >= 15.0 {
        alerts.push(Alert {
            user_id: ctx.user_id,
            rule: RuleId::MemorySustained,
            severity: Severity::Critical,
            detail: json!({ "mem_breach_seconds": ctx.mem_breach_seconds }),
        });
    }

    if ctx.hourly_limit > 0 {
        let ratio = ctx.executions_in_last_hour as f64 / ctx.hourly_limit as f64;
        if ratio >= 1.0 {
            alerts.push(Alert {
                user_id: ctx.user_id,
                rule: RuleId::HourlyRate,
                severity: Severity::Critical,
                detail: json!({ "executions_in_last_hour": ctx.executions_in_last_hour, "hourly_limit": ctx.hourly_limit }),
            });
        } else if ratio >= 0.8 {
            alerts.push(Alert {
                user_id: ctx.user_id,
                rule: RuleId::HourlyRate,
                severity: Severity::Warning,
                detail: json!({ "executions_in_last_hour": ctx.executions_in_last_hour, "hourly_limit": ctx.hourly_limit }),
            });
        }
    }

    if !ctx.recent.is_empty() {
        let sample: Vec<&ExecutionRecord> = ctx.recent.iter().take(20).collect();
        let failures = sample
            .iter()
            .filter(|r| r.status != ExecutionStatus::Completed)
            .count();
        let ratio = failures as f64 / sample.len() as f64;
        if ratio >= 0.75 {
            alerts.push(Alert {
                user_id: ctx.user_id,
                rule: RuleId::FailureRatio,
                severity: Severity::Warning,
                detail: json!({ "failures": failures, "sample_size": sample.len() }),
            });
        }
    }

    alerts
}

/// Wraps [`evaluate`] with the idempotency window and the auto-block side
/// effect spec.md §4.8 describes.
pub struct AbuseDetector<P: ProfileStore, A: AuditStore> {
    profiles: Arc<P>,
    audit: Arc<A>,
    last_alerted: Mutex<HashMap<(Uuid, &'static str), Instant>>,
}

impl<P: ProfileStore, A: AuditStore> AbuseDetector<P, A> {
    pub fn new(profiles: Arc<P>, audit: Arc<A>) -> Self {
        Self {
            profiles,
            audit,
            last_alerted: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the rule pass, drops alerts repeated within the idempotency
    /// window, and auto-blocks on any fresh critical alert when policy
    /// permits.
    pub async fn observe(&self, ctx: EvaluationContext<'_>, auto_block_on_abuse: bool) -> Vec<Alert> {
        let raw = evaluate(&ctx);
        let mut fresh = Vec::with_capacity(raw.len());

        for alert in raw {
            let key = (alert.user_id, alert.rule.as_str());
            let should_emit = {
                let mut guard = self.last_alerted.lock().await;
                let now = Instant::now();
                let stale = guard
                    .get(&key)
                    .map(|last| now.duration_since(*last) >= IDEMPOTENCY_WINDOW)
                    .unwrap_or(true);
                if stale {
                    guard.insert(key, now);
                }
                stale
            };
            if !should_emit {
                continue;
            }

            if alert.severity == Severity::Critical && auto_block_on_abuse {
                if let Err(err) = self.profiles.block(alert.user_id, alert.rule.as_str()).await {
                    warn!(user_id = %alert.user_id, error = %err, "auto-block failed");
                } else {
                    let _ = self
                        .audit
                        .append(AuditEvent {
                            user_id: Some(alert.user_id),
                            ..AuditEvent::new("user.block", "critical", alert.detail.clone())
                        })
                        .await;
                }
            }

            fresh.push(alert);
        }

        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::{InMemoryAuditStore, InMemoryProfileStore, Profile, Role, UserStatus};

    fn ctx(user_id: Uuid) -> EvaluationContext<'static> {
        EvaluationContext {
            user_id,
            cpu_breach_seconds: 0.0,
            mem_breach_seconds: 0.0,
            executions_in_last_hour: 0,
            hourly_limit: 60,
            recent: &[],
        }
    }

    #[test]
    fn cpu_breach_below_thirty_seconds_is_silent() {
        let user_id = Uuid::new_v4();
        let mut c = ctx(user_id);
        c.cpu_breach_seconds = 29.0;
        assert!(evaluate(&c).is_empty());
    }

    #[test]
    fn cpu_breach_crosses_warning_then_critical() {
        let user_id = Uuid::new_v4();
        let mut c = ctx(user_id);
        c.cpu_breach_seconds = 31.0;
        let alerts = evaluate(&c);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);

        c.cpu_breach_seconds = 121.0;
        let alerts = evaluate(&c);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn hourly_rate_thresholds_match_ratio() {
        let user_id = Uuid::new_v4();
        let mut c = ctx(user_id);
        c.hourly_limit = 100;
        c.executions_in_last_hour = 80;
        let alerts = evaluate(&c);
        assert!(alerts.iter().any(|a| a.rule == RuleId::HourlyRate && a.severity == Severity::Warning));

        c.executions_in_last_hour = 100;
        let alerts = evaluate(&c);
        assert!(alerts.iter().any(|a| a.rule == RuleId::HourlyRate && a.severity == Severity::Critical));
    }

    fn record_with_status(user_id: Uuid, status: ExecutionStatus) -> ExecutionRecord {
        let mut r = ExecutionRecord::new(Uuid::new_v4(), user_id, Uuid::new_v4(), "python".into(), "m.py".into());
        r.status = status;
        r
    }

    #[test]
    fn failure_ratio_over_three_quarters_warns() {
        let user_id = Uuid::new_v4();
        let recent: Vec<ExecutionRecord> = (0..20)
            .map(|i| {
                if i < 16 {
                    record_with_status(user_id, ExecutionStatus::Crashed)
                } else {
                    record_with_status(user_id, ExecutionStatus::Completed)
                }
            })
            .collect();
        let mut c = ctx(user_id);
        c.recent = &recent;
        let alerts = evaluate(&c);
        assert!(alerts.iter().any(|a| a.rule == RuleId::FailureRatio));
    }

    #[tokio::test]
    async fn repeated_critical_alert_is_suppressed_within_window() {
        let user_id = Uuid::new_v4();
        let profiles = Arc::new(InMemoryProfileStore::new());
        profiles
            .seed(Profile {
                user_id,
                email: "a@example.com".into(),
                role: Role::User,
                status: UserStatus::Active,
                storage_used_mb: 0,
                block_reason: None,
            })
            .await;
        let audit = Arc::new(InMemoryAuditStore::new());
        let detector = AbuseDetector::new(profiles.clone(), audit);

        let make_ctx = || EvaluationContext {
            user_id,
            cpu_breach_seconds: 0.0,
            mem_breach_seconds: 16.0,
            executions_in_last_hour: 0,
            hourly_limit: 60,
            recent: &[],
        };

        let first = detector.observe(make_ctx(), true).await;
        assert_eq!(first.len(), 1);
        assert_eq!(profiles.get(user_id).await.unwrap().status, UserStatus::Blocked);

        profiles.unblock(user_id).await.unwrap();
        let second = detector.observe(make_ctx(), true).await;
        assert!(second.is_empty());
        assert_eq!(profiles.get(user_id).await.unwrap().status, UserStatus::Active);
    }
}
