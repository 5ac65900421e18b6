//! Backend configuration kept in storage: root credentials and lease limits.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StorageError;

/// Storage key of the root credentials.
pub const ROOT_CONFIG_KEY: &str = "config/root";
/// Storage key of the lease configuration.
pub const LEASE_CONFIG_KEY: &str = "config/lease";

/// Lease duration used when no lease configuration is stored.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60 * 60);

/// Credentials the backend uses to call the identity provider.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootConfig {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl fmt::Debug for RootConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Lease limits for issued credentials.
///
/// `lease` caps a single renewal; `lease_max` caps the total lifetime
/// measured from issue. A zero `lease_max` means no total cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(rename = "lease_secs", with = "duration_secs")]
    pub lease: Duration,
    #[serde(rename = "lease_max_secs", with = "duration_secs")]
    pub lease_max: Duration,
}

impl LeaseConfig {
    pub fn new(lease: Duration, lease_max: Duration) -> Self {
        Self { lease, lease_max }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            lease_max: Duration::ZERO,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Durable configuration source of the backend.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn root_config(&self) -> Result<Option<RootConfig>, StorageError>;

    async fn put_root_config(&self, config: &RootConfig) -> Result<(), StorageError>;

    async fn lease_config(&self) -> Result<Option<LeaseConfig>, StorageError>;

    async fn put_lease_config(&self, config: &LeaseConfig) -> Result<(), StorageError>;
}

/// In-memory configuration store keyed like the durable one.
#[derive(Default)]
pub struct MemoryConfigStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with root credentials already in place.
    pub fn with_root(root: RootConfig) -> Result<Self, StorageError> {
        let mut entries = HashMap::new();
        entries.insert(ROOT_CONFIG_KEY.to_string(), serde_json::to_value(root)?);
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn root_config(&self) -> Result<Option<RootConfig>, StorageError> {
        self.get(ROOT_CONFIG_KEY).await
    }

    async fn put_root_config(&self, config: &RootConfig) -> Result<(), StorageError> {
        self.put(ROOT_CONFIG_KEY, config).await
    }

    async fn lease_config(&self) -> Result<Option<LeaseConfig>, StorageError> {
        self.get(LEASE_CONFIG_KEY).await
    }

    async fn put_lease_config(&self, config: &LeaseConfig) -> Result<(), StorageError> {
        self.put(LEASE_CONFIG_KEY, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_config_serializes_as_seconds() {
        let config = LeaseConfig::new(Duration::from_secs(1800), Duration::from_secs(7200));
        let value = serde_json::to_value(config).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "lease_secs": 1800, "lease_max_secs": 7200 })
        );
        let back: LeaseConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }

    #[tokio::test]
    async fn memory_store_starts_empty() {
        let store = MemoryConfigStore::new();
        assert!(store.root_config().await.unwrap().is_none());
        assert!(store.lease_config().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_put_and_get() {
        let store = MemoryConfigStore::new();
        let lease = LeaseConfig::new(Duration::from_secs(600), Duration::from_secs(3600));
        store.put_lease_config(&lease).await.unwrap();
        assert_eq!(store.lease_config().await.unwrap(), Some(lease));
    }

    #[test]
    fn root_config_debug_redacts_secret() {
        let root = RootConfig {
            access_key: "AKIAROOT".into(),
            secret_key: "rootsecret".into(),
            region: "us-east-1".into(),
        };
        let rendered = format!("{:?}", root);
        assert!(rendered.contains("AKIAROOT"));
        assert!(!rendered.contains("rootsecret"));
    }
}
