// Last-known token, in memory and persisted

use std::sync::{Arc, RwLock};

use super::types::{mask, non_empty, CacheEntry, CacheSource};
use crate::store::{self, PersistCompletion, SharedStore, StoreWriter, CACHED_TOKEN};

/// In-process token cache backed by the config store
///
/// The memory copy is the fast path; the persisted copy is the recovery
/// source when memory is empty. Writers are last-writer-wins, in memory
/// and in the store alike.
#[derive(Clone)]
pub struct TokenCache {
    memory: Arc<RwLock<Option<String>>>,
    store: SharedStore,
    writer: StoreWriter,
}

impl TokenCache {
    pub fn new(store: SharedStore, writer: StoreWriter) -> Self {
        Self {
            memory: Arc::new(RwLock::new(None)),
            store,
            writer,
        }
    }

    /// Memory copy only
    pub fn peek(&self) -> Option<String> {
        self.memory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Memory copy, falling back to the persisted copy
    ///
    /// Never consults the credential source.
    pub async fn get(&self) -> Option<CacheEntry> {
        if let Some(token) = self.peek() {
            return Some(CacheEntry {
                token,
                source: CacheSource::Memory,
            });
        }

        let token = store::get_or_none(self.store.as_ref(), CACHED_TOKEN).await;
        let token = non_empty(token)?;
        let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ref newer) = *memory {
            // A set landed while the store was being read
            return Some(CacheEntry {
                token: newer.clone(),
                source: CacheSource::Memory,
            });
        }
        tracing::debug!("Loaded cached token {} from store", mask(&token));
        *memory = Some(token.clone());

        Some(CacheEntry {
            token,
            source: CacheSource::Persisted,
        })
    }

    /// Replace the cached value
    ///
    /// Empty values are ignored. Persistence failure is logged, never
    /// rolled back into the memory copy.
    pub fn set(&self, token: &str, persist: bool) -> PersistCompletion {
        let token = token.trim();
        if token.is_empty() {
            tracing::debug!("Ignoring empty token for cache");
            return PersistCompletion::skipped();
        }

        // Submitting under the memory lock keeps store order equal to memory order.
        let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
        *memory = Some(token.to_string());
        if !persist {
            return PersistCompletion::skipped();
        }
        self.writer.submit(vec![(CACHED_TOKEN, token.to_string())])
    }
}
