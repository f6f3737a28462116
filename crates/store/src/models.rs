use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UserStatus {
    Active,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// Per-user profile, as read by the `Admitter` when refreshing a quota
/// snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
    pub status: UserStatus,
    pub storage_used_mb: u64,
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: Uuid,
    pub owner_id: Uuid,
    pub github_url: Option<String>,
}

/// Execution lifecycle states, matching spec.md §4.5.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Preparing,
    Launching,
    Running,
    Completed,
    Stopped,
    Timeout,
    OutOfMemory,
    KilledAdmin,
    Crashed,
    SetupFailed,
    Rejected,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Stopped
                | ExecutionStatus::Timeout
                | ExecutionStatus::OutOfMemory
                | ExecutionStatus::KilledAdmin
                | ExecutionStatus::Crashed
                | ExecutionStatus::SetupFailed
                | ExecutionStatus::Rejected
        )
    }
}

/// Reason an execution reached a terminal state, persisted alongside status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    Stopped,
    Timeout,
    OutOfMemory,
    KilledAdmin,
    Crashed,
    SetupFailed,
}

/// The persisted execution record — required columns per spec.md §6.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub language: String,
    pub file_path: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub execution_time_ms: Option<i64>,
    pub memory_used_mb: Option<u64>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub truncated_stdout: bool,
    pub truncated_stderr: bool,
    pub termination_reason: Option<TerminationReason>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(id: Uuid, user_id: Uuid, project_id: Uuid, language: String, file_path: String) -> Self {
        Self {
            id,
            user_id,
            project_id,
            language,
            file_path,
            status: ExecutionStatus::Queued,
            exit_code: None,
            execution_time_ms: None,
            memory_used_mb: None,
            stdout_bytes: 0,
            stderr_bytes: 0,
            truncated_stdout: false,
            truncated_stderr: false,
            termination_reason: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// Fields mutated by `UpdateTerminal`.
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub execution_time_ms: Option<i64>,
    pub memory_used_mb: Option<u64>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub truncated_stdout: bool,
    pub truncated_stderr: bool,
    pub termination_reason: TerminationReason,
    pub ended_at: DateTime<Utc>,
}

/// Typed, coerced settings snapshot — see spec.md §6.5 for defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub max_cpu_percent: u32,
    pub max_memory_mb: u64,
    pub max_runtime_seconds: u64,
    pub max_zip_size_mb: u64,
    pub max_projects_per_user: u32,
    pub max_executions_per_hour: u32,
    pub auto_block_on_abuse: bool,
    pub container_cleanup_hours: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_cpu_percent: 50,
            max_memory_mb: 256,
            max_runtime_seconds: 30,
            max_zip_size_mb: 50,
            max_projects_per_user: 100,
            max_executions_per_hour: 60,
            auto_block_on_abuse: false,
            container_cleanup_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub severity: String,
    pub user_id: Option<Uuid>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, severity: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            severity: severity.into(),
            user_id: None,
            detail,
            created_at: Utc::now(),
        }
    }
}

/// A single blob entry as listed from the content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobEntry {
    pub path: String,
    pub size: u64,
}
