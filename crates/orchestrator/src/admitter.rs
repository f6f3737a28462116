//! C4 `Admitter`: per-user quotas, rate caps, block status, and global
//! concurrency gating, evaluated atomically before an execution starts
//! (spec.md §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

use store::{
    CachedSettingsStore, ExecutionRecordStore, Project, ProjectStore, ProfileStore, SettingsStore,
    UserStatus,
};

use crate::error::{OrchestratorError, Result};

/// Default per-user concurrent execution cap. Not part of `Settings`
/// (spec.md §6.5 does not list one); the spec's own S4 scenario configures
/// this value per test rather than reading it from the settings table, so
/// it is a constructor argument here rather than a `Settings` field.
pub const DEFAULT_USER_CONCURRENCY_LIMIT: usize = 3;

/// Held by the `Orchestrator` fibre for the lifetime of one execution.
/// Dropping it (on any terminal path, including setup failure) releases
/// the live concurrency slot — the release is therefore exactly-once and
/// panic-safe.
pub struct AdmissionToken {
    user_id: Uuid,
    counter: Arc<AtomicUsize>,
    released: bool,
}

impl AdmissionToken {
    fn new(user_id: Uuid, counter: Arc<AtomicUsize>) -> Self {
        Self {
            user_id,
            counter,
            released: false,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Explicit early release; idempotent. `Drop` calls this too, so
    /// callers are never required to invoke it directly.
    pub fn release(&mut self) {
        if !self.released {
            self.counter.fetch_sub(1, Ordering::SeqCst);
            self.released = true;
        }
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct Admission {
    pub token: AdmissionToken,
    pub project: Project,
}

pub struct Admitter<P, J, E, S>
where
    P: ProfileStore,
    J: ProjectStore,
    E: ExecutionRecordStore,
    S: SettingsStore,
{
    profiles: Arc<P>,
    projects: Arc<J>,
    executions: Arc<E>,
    settings: Arc<CachedSettingsStore<S>>,
    user_concurrency_limit: usize,
    // per-user live concurrency counters; only this type mutates them.
    live: AsyncMutex<HashMap<Uuid, Arc<AtomicUsize>>>,
    // per-user admission lock: held across the check-then-increment in
    // `admit` so two concurrent `Run`s for the same user can't both read
    // the cap as unbreached before either increments it.
    admit_locks: AsyncMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl<P, J, E, S> Admitter<P, J, E, S>
where
    P: ProfileStore,
    J: ProjectStore,
    E: ExecutionRecordStore,
    S: SettingsStore,
{
    pub fn new(
        profiles: Arc<P>,
        projects: Arc<J>,
        executions: Arc<E>,
        settings: Arc<CachedSettingsStore<S>>,
    ) -> Self {
        Self::with_concurrency_limit(
            profiles,
            projects,
            executions,
            settings,
            DEFAULT_USER_CONCURRENCY_LIMIT,
        )
    }

    pub fn with_concurrency_limit(
        profiles: Arc<P>,
        projects: Arc<J>,
        executions: Arc<E>,
        settings: Arc<CachedSettingsStore<S>>,
        user_concurrency_limit: usize,
    ) -> Self {
        Self {
            profiles,
            projects,
            executions,
            settings,
            user_concurrency_limit,
            live: AsyncMutex::new(HashMap::new()),
            admit_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Current number of live (non-released) admissions for a user.
    /// Exposed for `ActiveList` and tests; not used for gating itself.
    pub async fn live_count(&self, user_id: Uuid) -> usize {
        let guard = self.live.lock().await;
        guard
            .get(&user_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Evaluates §4.4 steps 1-3 atomically per user and, on success,
    /// returns an `Admission` carrying the token the `Orchestrator` must
    /// hold for the run's lifetime.
    pub async fn admit(&self, user_id: Uuid, project_id: Uuid, language: &str) -> Result<Admission> {
        let profile = self.profiles.get(user_id).await?;
        if profile.status != UserStatus::Active {
            return Err(OrchestratorError::Forbidden);
        }

        let project = self.projects.get(project_id).await?;
        if project.owner_id != user_id {
            return Err(OrchestratorError::NotFound);
        }

        let settings = self.settings.snapshot().await?;

        // Derived storage ceiling: Settings (§6.5) carries no direct
        // "total bytes" quota, only a per-upload cap and a project-count
        // cap. We treat their product as the storage ceiling a profile's
        // `storage_used_mb` must stay under (see DESIGN.md).
        let storage_ceiling_mb =
            settings.max_projects_per_user as f64 * settings.max_zip_size_mb as f64;
        if profile.storage_used_mb as f64 > storage_ceiling_mb {
            return Err(OrchestratorError::QuotaExceeded);
        }

        // per-user counter, created on first use
        let counter = {
            let mut guard = self.live.lock().await;
            guard
                .entry(user_id)
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone()
        };
        let user_lock = {
            let mut guard = self.admit_locks.lock().await;
            guard
                .entry(user_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        // holds the per-user lock across the check-then-increment below so
        // two concurrent admits for the same user can't both observe the
        // cap as unbreached before either one increments it.
        let _serialized = user_lock.lock().await;

        let current = counter.load(Ordering::SeqCst);
        if current >= self.user_concurrency_limit {
            debug!(%user_id, current, limit = self.user_concurrency_limit, "concurrent cap reached");
            return Err(OrchestratorError::TooManyConcurrent);
        }

        let count_in_hour = self.executions.count_in_hour(user_id).await?;
        if count_in_hour >= settings.max_executions_per_hour {
            warn!(%user_id, count_in_hour, "hourly cap reached");
            return Err(OrchestratorError::RateLimited);
        }

        // language support is validated by the caller against the
        // catalogue before calling `admit`; re-validated defensively here
        // is unnecessary since `CatalogueError` already maps to
        // `UnsupportedLanguage` at the call site.
        let _ = language;

        let new_count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%user_id, new_count, "admission granted");

        Ok(Admission {
            token: AdmissionToken::new(user_id, counter),
            project,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::{
        InMemoryExecutionRecordStore, InMemoryProfileStore, InMemoryProjectStore,
        InMemorySettingsStore, Profile, Project, Role, Settings,
    };

    async fn make(
        user_id: Uuid,
        project_id: Uuid,
    ) -> Admitter<
        InMemoryProfileStore,
        InMemoryProjectStore,
        InMemoryExecutionRecordStore,
        InMemorySettingsStore,
    > {
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
        let projects = Arc::new(InMemoryProjectStore::new());
        projects
            .seed(Project {
                project_id,
                owner_id: user_id,
                github_url: None,
            })
            .await;
        let executions = Arc::new(InMemoryExecutionRecordStore::new());
        let settings = Arc::new(CachedSettingsStore::with_default_ttl(
            InMemorySettingsStore::new(Settings::default()),
        ));
        Admitter::with_concurrency_limit(profiles, projects, executions, settings, 1)
    }

    #[tokio::test]
    async fn second_concurrent_admission_is_rejected_with_limit_one() {
        let user_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let admitter = make(user_id, project_id).await;

        let first = admitter.admit(user_id, project_id, "python").await.unwrap();
        let second = admitter.admit(user_id, project_id, "python").await;
        assert!(matches!(second, Err(OrchestratorError::TooManyConcurrent)));

        drop(first);
        let third = admitter.admit(user_id, project_id, "python").await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn truly_concurrent_admits_for_same_user_admit_exactly_the_limit() {
        let user_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let admitter = make(user_id, project_id).await;

        let (first, second) = tokio::join!(
            admitter.admit(user_id, project_id, "python"),
            admitter.admit(user_id, project_id, "python"),
        );
        let ok_count = [&first, &second].iter().filter(|r| r.is_ok()).count();
        let rejected_count = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(OrchestratorError::TooManyConcurrent)))
            .count();
        assert_eq!(ok_count, 1);
        assert_eq!(rejected_count, 1);
    }

    #[tokio::test]
    async fn blocked_user_is_forbidden() {
        let user_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let admitter = make(user_id, project_id).await;
        admitter.profiles.block(user_id, "test").await.unwrap();

        let result = admitter.admit(user_id, project_id, "python").await;
        assert!(matches!(result, Err(OrchestratorError::Forbidden)));
    }

    #[tokio::test]
    async fn project_owned_by_another_user_is_not_found() {
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let admitter = make(owner, project_id).await;
        admitter
            .profiles
            .seed(Profile {
                user_id: intruder,
                email: "b@example.com".into(),
                role: Role::User,
                status: UserStatus::Active,
                storage_used_mb: 0,
                block_reason: None,
            })
            .await;

        let result = admitter.admit(intruder, project_id, "python").await;
        assert!(matches!(result, Err(OrchestratorError::NotFound)));
    }

    #[tokio::test]
    async fn token_release_is_idempotent() {
        let user_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let admitter = make(user_id, project_id).await;
        let mut admission = admitter.admit(user_id, project_id, "python").await.unwrap();
        assert_eq!(admitter.live_count(user_id).await, 1);
        admission.token.release();
        admission.token.release();
        assert_eq!(admitter.live_count(user_id).await, 0);
    }
}
