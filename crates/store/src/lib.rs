//! External collaborator interfaces required by the execution orchestrator
//! core (spec.md §6.3), plus in-memory implementations used by tests and a
//! Postgres-backed implementation of the record store for production.
//!
//! None of these traits encode orchestrator business logic — they are the
//! seams across which the core talks to the relational database, the blob
//! content store, and the browser-facing push channel, all of which are
//! explicitly out of scope for this crate (spec.md §1).

pub mod audit_store;
pub mod blob_store;
pub mod error;
pub mod execution_record_store;
pub mod models;
pub mod profile_store;
pub mod project_store;
pub mod push_bus;
pub mod settings_store;
pub mod tokens;

pub use audit_store::{AuditStore, InMemoryAuditStore};
pub use blob_store::{BlobStore, InMemoryBlobStore};
pub use error::{Result, StoreError};
pub use execution_record_store::{
    ExecutionRecordStore, InMemoryExecutionRecordStore, PostgresExecutionRecordStore,
};
pub use models::*;
pub use profile_store::{InMemoryProfileStore, ProfileStore};
pub use project_store::{InMemoryProjectStore, ProjectStore};
pub use push_bus::{InMemoryPushBus, PushBus};
pub use settings_store::{CachedSettingsStore, InMemorySettingsStore, SettingsStore};
pub use tokens::{Claims, HmacTokens, TokenError, Tokens};
