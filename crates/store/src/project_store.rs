use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::Project;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, project_id: Uuid) -> Result<Project>;
    async fn update_github_url(&self, project_id: Uuid, url: Option<&str>) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct InMemoryProjectStore {
    inner: Arc<RwLock<HashMap<Uuid, Project>>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, project: Project) {
        self.inner.write().await.insert(project.project_id, project);
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn get(&self, project_id: Uuid) -> Result<Project> {
        self.inner
            .read()
            .await
            .get(&project_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_github_url(&self, project_id: Uuid, url: Option<&str>) -> Result<()> {
        let mut guard = self.inner.write().await;
        let project = guard.get_mut(&project_id).ok_or(StoreError::NotFound)?;
        project.github_url = url.map(str::to_string);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_github_url_then_clear() {
        let store = InMemoryProjectStore::new();
        let pid = Uuid::new_v4();
        store
            .seed(Project {
                project_id: pid,
                owner_id: Uuid::new_v4(),
                github_url: None,
            })
            .await;

        store
            .update_github_url(pid, Some("https://github.com/acme/repo.git"))
            .await
            .unwrap();
        let p = store.get(pid).await.unwrap();
        assert_eq!(p.github_url.as_deref(), Some("https://github.com/acme/repo.git"));

        store.update_github_url(pid, None).await.unwrap();
        let p = store.get(pid).await.unwrap();
        assert!(p.github_url.is_none());
    }
}
