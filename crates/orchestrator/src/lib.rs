//! C4-C9: admission, the per-execution state machine, stream fan-out,
//! resource sampling, abuse detection, and the git worker runner (spec.md
//! §4.4-§4.9), plus the transport-agnostic public API of spec.md §6.1/§6.2.
//!
//! This crate owns no I/O of its own beyond what `sandbox` and `store`
//! expose through their traits — it is pure orchestration logic over those
//! seams, which keeps it runnable against in-memory store implementations
//! in tests and Postgres/Docker-backed ones in production.

pub mod abuse_detector;
pub mod admitter;
pub mod error;
pub mod frame;
pub mod git_runner;
pub mod orchestrator;
pub mod resource_sampler;
pub mod stream_mux;

pub use abuse_detector::{AbuseDetector, Alert, EvaluationContext, RuleId, Severity};
pub use admitter::{Admission, AdmissionToken, Admitter, DEFAULT_USER_CONCURRENCY_LIMIT};
pub use error::{OrchestratorError, Result};
pub use frame::{Frame, FramePayload, StatusValue};
pub use git_runner::{
    redact_credentials, GitResult, GitRunner, RESULT_END_MARKER, RESULT_START_MARKER,
    SUPPORTED_OPERATIONS,
};
pub use orchestrator::{
    Actor, ActiveListEntry, Orchestrator, RunRequest, DEFAULT_OUTPUT_CAP_BYTES, GRACE_PERIOD,
};
pub use resource_sampler::{ActiveSample, ResourceSampler, DEFAULT_SAMPLE_INTERVAL};
pub use stream_mux::{StreamMuxHandle, DEFAULT_RING_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER};
