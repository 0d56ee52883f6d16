// Persisted key-value state
// Cached token, delivery bookkeeping and relay settings

mod memory;
mod sqlite;
mod writer;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::RelayError;

pub use memory::MemoryConfigStore;
pub use sqlite::SqliteConfigStore;
pub use writer::{PersistCompletion, StoreWriter, WriteBatch};

pub const CACHED_TOKEN: &str = "cached_token";
pub const LAST_DELIVERED_TOKEN: &str = "last_delivered_token";
pub const LAST_DELIVERED_AT_MILLIS: &str = "last_delivered_at_millis";
pub const RELAY_ENDPOINT: &str = "relay_endpoint";
pub const RELAY_AUTH_TOKEN: &str = "relay_auth_token";

/// Asynchronous key-value store
///
/// A returned future resolves once the operation has landed, so callers that
/// need completion await it and the rest spawn it.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a value, `Ok(None)` when the key is unset
    async fn get(&self, key: &str) -> Result<Option<String>, RelayError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<(), RelayError>;
}

/// Relay settings, read fresh on every delivery attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayConfig {
    pub endpoint: Option<String>,
    pub auth_token: Option<String>,
}

/// Bookkeeping for the last confirmed delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryRecord {
    pub last_delivered_token: Option<String>,
    pub last_delivered_at_millis: i64,
}

/// Read a key, treating an unreachable store as a miss
pub async fn get_or_none(store: &dyn ConfigStore, key: &str) -> Option<String> {
    match store.get(key).await {
        Ok(value) => value.filter(|v| !v.trim().is_empty()),
        Err(e) => {
            tracing::warn!("Failed to read {} from config store: {}", key, e);
            None
        }
    }
}

/// Write a key, logging instead of failing
pub async fn set_best_effort(store: &dyn ConfigStore, key: &str, value: &str) -> bool {
    match store.set(key, value).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to persist {} to config store: {}", key, e);
            false
        }
    }
}

pub async fn load_relay_config(store: &dyn ConfigStore) -> RelayConfig {
    RelayConfig {
        endpoint: get_or_none(store, RELAY_ENDPOINT).await,
        auth_token: get_or_none(store, RELAY_AUTH_TOKEN).await,
    }
}

pub async fn load_delivery_record(store: &dyn ConfigStore) -> DeliveryRecord {
    let last_delivered_token = get_or_none(store, LAST_DELIVERED_TOKEN).await;
    let last_delivered_at_millis = get_or_none(store, LAST_DELIVERED_AT_MILLIS)
        .await
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    DeliveryRecord {
        last_delivered_token,
        last_delivered_at_millis,
    }
}

/// Store entries for a delivery record, written together
pub fn delivery_record_entries(record: &DeliveryRecord) -> WriteBatch {
    let mut entries = Vec::with_capacity(2);
    if let Some(ref token) = record.last_delivered_token {
        entries.push((LAST_DELIVERED_TOKEN, token.clone()));
    }
    entries.push((
        LAST_DELIVERED_AT_MILLIS,
        record.last_delivered_at_millis.to_string(),
    ));
    entries
}

/// Shared store handle
pub type SharedStore = Arc<dyn ConfigStore>;
