//! Read-through cache — a per-operation snapshot of store keys.
//!
//! A scheduling pass resolves every attribute of many sibling units.
//! Loading the whole `units/` prefix once and answering field reads from
//! memory turns hundreds of round trips into one. The cache is meant to
//! live for a single pass and be dropped afterwards; it never observes
//! later writes except the ones made through [`StoreCache::put`].

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::StoreResult;
use crate::store::SharedStore;

pub struct StoreCache {
    store: SharedStore,
    entries: BTreeMap<String, String>,
    /// Prefixes that were loaded completely: a miss below them is authoritative.
    covered: Vec<String>,
}

impl StoreCache {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            entries: BTreeMap::new(),
            covered: Vec::new(),
        }
    }

    /// Create a cache with one prefix already loaded.
    pub async fn for_prefix(store: SharedStore, prefix: &str) -> StoreResult<Self> {
        let mut cache = Self::new(store);
        cache.load_prefix(prefix).await?;
        Ok(cache)
    }

    /// Load every key under `prefix` in one read.
    pub async fn load_prefix(&mut self, prefix: &str) -> StoreResult<()> {
        let kvs = self.store.get_prefix(prefix).await?;
        debug!(%prefix, keys = kvs.len(), "cache loaded prefix");
        self.entries.retain(|key, _| !key.starts_with(prefix));
        for kv in kvs {
            self.entries.insert(kv.key, kv.value);
        }
        if !self.is_covered(prefix) {
            self.covered.push(prefix.to_string());
        }
        Ok(())
    }

    fn is_covered(&self, key: &str) -> bool {
        self.covered.iter().any(|prefix| key.starts_with(prefix.as_str()))
    }

    /// Value of `key`, fetched from the store only when the snapshot
    /// cannot answer.
    pub async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        if let Some(value) = self.entries.get(key) {
            return Ok(Some(value.clone()));
        }
        if self.is_covered(key) {
            return Ok(None);
        }
        let value = self.store.get_value(key).await?;
        if let Some(value) = &value {
            self.entries.insert(key.to_string(), value.clone());
        }
        Ok(value)
    }

    /// All `(key, value)` pairs under `prefix`, loading it if needed.
    pub async fn get_all(&mut self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        if !self.is_covered(prefix) {
            self.load_prefix(prefix).await?;
        }
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    /// Record a write the caller already made to the store.
    pub fn put(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    /// Forget a key so the next read goes to the store.
    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
        self.covered.retain(|prefix| !key.starts_with(prefix.as_str()));
    }

    /// Forget everything under `prefix`.
    pub fn invalidate_prefix(&mut self, prefix: &str) {
        self.entries.retain(|key, _| !key.starts_with(prefix));
        self.covered.retain(|covered| {
            !covered.starts_with(prefix) && !prefix.starts_with(covered.as_str())
        });
    }
}
