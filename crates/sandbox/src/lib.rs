//! C1 `Sandbox` driver and C2 `BlobSync` (spec.md §4.2, §4.3): the
//! container-backed isolation unit lifecycle and bulk project file
//! materialisation the orchestrator builds executions on top of.

pub mod blob_sync;
pub mod docker;
pub mod driver;
pub mod error;
pub mod spec;

pub use blob_sync::{BlobSync, PullSummary, PushSummary, DEFAULT_IGNORE};
pub use docker::BollardSandboxDriver;
pub use driver::{
    safe_join, ExitOutcome, Handle, Sample, SandboxDriver, StreamEndpoints, TermSignal,
    DEFAULT_OP_DEADLINE,
};
pub use error::{Result, SandboxError};
pub use spec::{ExtraMountSpec, NetworkPolicy, SandboxSpec};
