use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::Result;

/// The browser-facing push channel, per spec.md §6.3 — the orchestrator
/// only publishes; routing a topic to a socket connection is out of scope
/// (spec.md §1).
#[async_trait]
pub trait PushBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;
}

/// Records published payloads in memory, keyed by topic, for tests and for
/// local development without a real socket-routing layer.
#[derive(Default, Clone)]
pub struct InMemoryPushBus {
    topics: Arc<RwLock<HashMap<String, Vec<Value>>>>,
}

impl InMemoryPushBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self, topic: &str) -> Vec<Value> {
        self.topics
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PushBus for InMemoryPushBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        trace!(topic, "push bus publish");
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(payload);
        Ok(())
    }
}
