// Relay state shared by the detector, guard and relay client

use chrono::Utc;
use std::sync::{Arc, RwLock};

use crate::store::{self, DeliveryRecord, SharedStore, StoreWriter};
use crate::token::TokenCache;

/// Process-wide relay state, owned by the orchestrator
pub struct SharedState {
    store: SharedStore,
    cache: TokenCache,
    delivery: RwLock<DeliveryRecord>,
    writer: StoreWriter,
}

impl SharedState {
    /// Build state from the store, restoring the persisted delivery record
    pub async fn load(store: SharedStore) -> Arc<Self> {
        let delivery = store::load_delivery_record(store.as_ref()).await;
        if let Some(ref token) = delivery.last_delivered_token {
            tracing::debug!(
                "Restored delivery record: {} at {}",
                crate::token::mask(token),
                delivery.last_delivered_at_millis
            );
        }

        let writer = StoreWriter::spawn(Arc::clone(&store));
        Arc::new(Self {
            cache: TokenCache::new(Arc::clone(&store), writer.clone()),
            store,
            delivery: RwLock::new(delivery),
            writer,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    pub fn delivery_record(&self) -> DeliveryRecord {
        self.delivery
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether `token` is the last confirmed delivery
    pub fn is_last_delivered(&self, token: &str) -> bool {
        let record = self.delivery.read().unwrap_or_else(|e| e.into_inner());
        record.last_delivered_token.as_deref() == Some(token)
    }

    /// Record a confirmed delivery and persist it best effort
    pub async fn record_delivery(&self, token: &str) -> DeliveryRecord {
        let record = DeliveryRecord {
            last_delivered_token: Some(token.to_string()),
            last_delivered_at_millis: Utc::now().timestamp_millis(),
        };

        let completion = {
            let mut delivery = self.delivery.write().unwrap_or_else(|e| e.into_inner());
            *delivery = record.clone();
            self.writer.submit(store::delivery_record_entries(&record))
        };

        completion.wait().await;
        record
    }
}
