use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::Result;
use crate::models::AuditEvent;

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct InMemoryAuditStore {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        info!(action = %event.action, severity = %event.severity, "audit event");
        self.events.write().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_is_observable_via_all() {
        let store = InMemoryAuditStore::new();
        store
            .append(AuditEvent::new(
                "user.block",
                "critical",
                serde_json::json!({"rule": "cpu-critical"}),
            ))
            .await
            .unwrap();
        let events = store.all().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "user.block");
    }
}
