use std::path::PathBuf;
use std::sync::Arc;

use orchestrator::{Admitter, GitRunner, Orchestrator};
use sandbox::{BlobSync, BollardSandboxDriver};
use store::{
    CachedSettingsStore, HmacTokens, InMemoryAuditStore, InMemoryBlobStore,
    InMemoryExecutionRecordStore, InMemoryProfileStore, InMemoryProjectStore,
    InMemoryPushBus, InMemorySettingsStore,
};

/// Concrete store/driver wiring for this binary. Every collaborator in
/// spec.md §6.3 has an in-memory implementation used here; a deployment
/// backed by Postgres and a real blob store swaps these for the
/// corresponding `Postgres*`/S3-backed types without touching the
/// orchestrator crate (see DESIGN.md).
pub type AppOrchestrator = Orchestrator<
    BollardSandboxDriver,
    InMemoryProfileStore,
    InMemoryProjectStore,
    InMemoryExecutionRecordStore,
    InMemorySettingsStore,
    InMemoryAuditStore,
    InMemoryPushBus,
>;

pub type AppGitRunner = GitRunner<BollardSandboxDriver>;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<AppOrchestrator>,
    pub git_runner: Arc<AppGitRunner>,
    pub tokens: Arc<HmacTokens>,
    pub profiles: Arc<InMemoryProfileStore>,
    pub projects: Arc<InMemoryProjectStore>,
}

pub struct BuildError(pub String);

impl AppState {
    pub async fn build(scratch_root: PathBuf, host_dirs_root: PathBuf) -> anyhow::Result<Self> {
        let catalogue = Arc::new(catalogue::LanguageCatalogue::with_builtin_defaults());
        let driver = Arc::new(BollardSandboxDriver::connect(host_dirs_root)?);
        let blob_store: Arc<dyn store::BlobStore> = Arc::new(InMemoryBlobStore::new());
        let blob_sync = Arc::new(BlobSync::new(blob_store.clone()));
        let git_blob_sync = BlobSync::new(blob_store);

        let profiles = Arc::new(InMemoryProfileStore::new());
        let projects = Arc::new(InMemoryProjectStore::new());
        let executions = Arc::new(InMemoryExecutionRecordStore::new());
        let settings = Arc::new(CachedSettingsStore::with_default_ttl(
            InMemorySettingsStore::default(),
        ));
        let audit = Arc::new(InMemoryAuditStore::new());
        let push_bus = Arc::new(InMemoryPushBus::new());

        let admitter = Arc::new(Admitter::new(
            profiles.clone(),
            projects.clone(),
            executions.clone(),
            settings.clone(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            catalogue.clone(),
            driver.clone(),
            blob_sync.clone(),
            admitter,
            profiles.clone(),
            executions,
            settings,
            audit,
            push_bus,
            scratch_root,
        ));

        let git_runner = Arc::new(GitRunner::new(driver, catalogue, git_blob_sync));

        let secret = std::env::var("ORCHESTRATOR_TOKEN_SECRET")
            .unwrap_or_else(|_| "dev-only-insecure-secret".to_string());
        let tokens = Arc::new(HmacTokens::new(secret));

        Ok(Self {
            orchestrator,
            git_runner,
            tokens,
            profiles,
            projects,
        })
    }
}
