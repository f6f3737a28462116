use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{Profile, UserStatus};

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Profile>;
    async fn increment_execution_count(&self, user_id: Uuid) -> Result<()>;
    async fn block(&self, user_id: Uuid, reason: &str) -> Result<()>;
    async fn unblock(&self, user_id: Uuid) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct InMemoryProfileStore {
    inner: Arc<RwLock<HashMap<Uuid, Profile>>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, profile: Profile) {
        self.inner.write().await.insert(profile.user_id, profile);
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(&self, user_id: Uuid) -> Result<Profile> {
        self.inner
            .read()
            .await
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn increment_execution_count(&self, _user_id: Uuid) -> Result<()> {
        // Execution counts are derived from `ExecutionRecordStore::count_in_hour`;
        // this store only tracks identity, quota, and block status.
        Ok(())
    }

    async fn block(&self, user_id: Uuid, reason: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        let profile = guard.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        profile.status = UserStatus::Blocked;
        profile.block_reason = Some(reason.to_string());
        Ok(())
    }

    async fn unblock(&self, user_id: Uuid) -> Result<()> {
        let mut guard = self.inner.write().await;
        let profile = guard.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        profile.status = UserStatus::Active;
        profile.block_reason = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn profile(id: Uuid) -> Profile {
        Profile {
            user_id: id,
            email: "u@example.com".into(),
            role: Role::User,
            status: UserStatus::Active,
            storage_used_mb: 0,
            block_reason: None,
        }
    }

    #[tokio::test]
    async fn block_then_unblock_round_trips() {
        let store = InMemoryProfileStore::new();
        let id = Uuid::new_v4();
        store.seed(profile(id)).await;

        store.block(id, "abuse-rule-1").await.unwrap();
        let p = store.get(id).await.unwrap();
        assert_eq!(p.status, UserStatus::Blocked);
        assert_eq!(p.block_reason.as_deref(), Some("abuse-rule-1"));

        store.unblock(id).await.unwrap();
        let p = store.get(id).await.unwrap();
        assert_eq!(p.status, UserStatus::Active);
        assert!(p.block_reason.is_none());
    }
}
