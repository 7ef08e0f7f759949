//! Saga state persistence.
//!
//! Handlers keep long-running workflow state here, keyed by correlation id,
//! so it survives retries of the messages that drive the workflow.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

// ---------------------------------------------------------------------------
// SagaStore trait
// ---------------------------------------------------------------------------

/// Opaque key-value store for saga state.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Loads the state stored under `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreachable.
    async fn load(&self, correlation_id: &str) -> anyhow::Result<Option<Value>>;

    /// Stores `state`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreachable.
    async fn store(&self, correlation_id: &str, state: Value) -> anyhow::Result<()>;

    /// Removes and returns the state, e.g. when a saga completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreachable.
    async fn remove(&self, correlation_id: &str) -> anyhow::Result<Option<Value>>;
}

// ---------------------------------------------------------------------------
// InMemorySagaStore
// ---------------------------------------------------------------------------

/// Process-local saga store backed by [`DashMap`]. State is lost on restart.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    entries: DashMap<String, Value>,
}

impl InMemorySagaStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored saga entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn load(&self, correlation_id: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.get(correlation_id).map(|v| v.clone()))
    }

    async fn store(&self, correlation_id: &str, state: Value) -> anyhow::Result<()> {
        self.entries.insert(correlation_id.to_string(), state);
        Ok(())
    }

    async fn remove(&self, correlation_id: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.remove(correlation_id).map(|(_, v)| v))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn store_load_remove() {
        let store = InMemorySagaStore::new();
        assert!(store.load("order-1").await.unwrap().is_none());

        store.store("order-1", json!({ "step": 1 })).await.unwrap();
        store.store("order-1", json!({ "step": 2 })).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("order-1").await.unwrap(), Some(json!({ "step": 2 })));

        assert_eq!(store.remove("order-1").await.unwrap(), Some(json!({ "step": 2 })));
        assert!(store.is_empty());
        assert!(store.remove("order-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usable_as_trait_object() {
        let store: std::sync::Arc<dyn SagaStore> = std::sync::Arc::new(InMemorySagaStore::new());
        store.store("c-1", json!("started")).await.unwrap();
        assert_eq!(store.load("c-1").await.unwrap(), Some(json!("started")));
    }
}
