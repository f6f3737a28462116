use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::Result;
use crate::models::Settings;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self) -> Result<Settings>;
    async fn set(&self, settings: Settings) -> Result<()>;
}

/// In-memory implementation, also used as the default when the process has
/// no external settings backend configured.
#[derive(Clone)]
pub struct InMemorySettingsStore {
    inner: Arc<RwLock<Settings>>,
}

impl InMemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }
}

impl Default for InMemorySettingsStore {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self) -> Result<Settings> {
        Ok(*self.inner.read().await)
    }

    async fn set(&self, settings: Settings) -> Result<()> {
        *self.inner.write().await = settings;
        Ok(())
    }
}

/// A generic TTL cache in front of any `SettingsStore`, per spec.md §5
/// ("Settings as a snapshot" / §9 design note) and the teacher's pattern of
/// caching configuration with explicit invalidation on write.
pub struct CachedSettingsStore<S: SettingsStore> {
    inner: S,
    ttl: StdDuration,
    cached: RwLock<Option<(Settings, Instant)>>,
}

impl<S: SettingsStore> CachedSettingsStore<S> {
    pub fn new(inner: S, ttl: StdDuration) -> Self {
        Self {
            inner,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub fn with_default_ttl(inner: S) -> Self {
        Self::new(inner, StdDuration::from_secs(10))
    }

    /// Read the cached snapshot, refreshing from the backing store if the
    /// TTL has elapsed. Never blocks a running execution on a write — those
    /// only invalidate the cache for the *next* admission.
    pub async fn snapshot(&self) -> Result<Settings> {
        {
            let guard = self.cached.read().await;
            if let Some((settings, fetched_at)) = *guard {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(settings);
                }
            }
        }
        let fresh = self.inner.get().await?;
        let mut guard = self.cached.write().await;
        *guard = Some((fresh, Instant::now()));
        Ok(fresh)
    }

    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    pub async fn write_through(&self, settings: Settings) -> Result<()> {
        self.inner.set(settings).await?;
        self.invalidate().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_is_served_from_cache_within_ttl() {
        let backing = InMemorySettingsStore::default();
        let cached = CachedSettingsStore::new(backing.clone(), StdDuration::from_secs(60));

        let first = cached.snapshot().await.unwrap();
        assert_eq!(first.max_runtime_seconds, 30);

        // Mutate the backing store directly; the cache should not see it yet.
        backing
            .set(Settings {
                max_runtime_seconds: 99,
                ..Settings::default()
            })
            .await
            .unwrap();
        let second = cached.snapshot().await.unwrap();
        assert_eq!(second.max_runtime_seconds, 30);
    }

    #[tokio::test]
    async fn write_through_invalidates_immediately() {
        let backing = InMemorySettingsStore::default();
        let cached = CachedSettingsStore::new(backing, StdDuration::from_secs(60));

        cached.snapshot().await.unwrap();
        cached
            .write_through(Settings {
                max_runtime_seconds: 5,
                ..Settings::default()
            })
            .await
            .unwrap();

        let after = cached.snapshot().await.unwrap();
        assert_eq!(after.max_runtime_seconds, 5);
    }
}
