//! API-key store port and in-memory implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ServiceError;

/// A stored credential: which service it belongs to plus the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub service: String,
    pub key: String,
}

#[async_trait]
pub trait ApiKeyService: Send + Sync {
    async fn get(&self, id: &str) -> Result<ApiKey, ServiceError>;
    async fn list(&self) -> Result<Vec<ApiKey>, ServiceError>;
    async fn create(&self, key: ApiKey) -> Result<(), ServiceError>;
    async fn delete(&self, id: &str) -> Result<(), ServiceError>;
}

/// In-memory key store for local runs and tests.
#[derive(Default)]
pub struct InMemoryApiKeys {
    keys: Mutex<HashMap<String, ApiKey>>,
}

impl InMemoryApiKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, id: &str, service: &str, key: &str) -> Self {
        self.keys.lock().insert(
            id.to_string(),
            ApiKey { id: id.to_string(), service: service.to_string(), key: key.to_string() },
        );
        self
    }
}

#[async_trait]
impl ApiKeyService for InMemoryApiKeys {
    async fn get(&self, id: &str) -> Result<ApiKey, ServiceError> {
        self.keys
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownApiKey(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<ApiKey>, ServiceError> {
        Ok(self.keys.lock().values().cloned().collect())
    }

    async fn create(&self, key: ApiKey) -> Result<(), ServiceError> {
        self.keys.lock().insert(key.id.clone(), key);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        self.keys
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ServiceError::UnknownApiKey(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crud_round_trip() {
        let store = InMemoryApiKeys::new();
        store
            .create(ApiKey { id: "k1".into(), service: "openai".into(), key: "sk-test".into() })
            .await
            .unwrap();

        assert_eq!(store.get("k1").await.unwrap().service, "openai");
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete("k1").await.unwrap();
        assert!(matches!(store.get("k1").await, Err(ServiceError::UnknownApiKey(_))));
    }
}
