//! The coordination store contract.
//!
//! Every dispatch component talks to the rest of the cluster through a
//! [`CoordinationStore`]: plain-text keys and values, prefix reads and
//! deletes, renewable leases, an atomic create-if-absent, and key or
//! prefix watches. Both backends ([`EtcdStore`](crate::EtcdStore) and
//! [`EmbeddedStore`](crate::EmbeddedStore)) implement it, so components
//! receive a [`SharedStore`] handle and never know which one they run on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreResult;

/// Identifier of a lease granted by the store.
pub type LeaseId = i64;

/// Shared, dynamically dispatched store handle.
pub type SharedStore = Arc<dyn CoordinationStore>;

/// A single key with its value and revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Store revision at which the key was created.
    pub create_revision: i64,
    /// Store revision of the last modification.
    pub mod_revision: i64,
    /// Lease the key is bound to, if any.
    pub lease: Option<LeaseId>,
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change delivered on a [`WatchStream`].
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// The key after the change. For deletes the value is empty.
    pub kv: KeyValue,
    /// The key before the change, when it existed.
    pub prev: Option<KeyValue>,
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        &self.kv.key
    }

    pub fn value(&self) -> &str {
        &self.kv.value
    }

    pub fn prev_value(&self) -> Option<&str> {
        self.prev.as_ref().map(|kv| kv.value.as_str())
    }

    /// A put that brought the key into existence.
    pub fn is_create(&self) -> bool {
        self.kind == EventKind::Put && self.kv.create_revision == self.kv.mod_revision
    }

    pub fn is_delete(&self) -> bool {
        self.kind == EventKind::Delete
    }
}

/// Ordered stream of watch events.
///
/// The stream ends (`next` returns `None`) when the backend loses the
/// subscription. Callers must resubscribe and resync; see
/// [`run_watch`](crate::run_watch).
pub struct WatchStream {
    rx: mpsc::Receiver<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(rx: mpsc::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Primitive operations against the shared key-value store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Atomically write a key only if it does not exist yet.
    ///
    /// Returns `true` when this call created the key.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// All keys starting with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// Delete one key. Returns the number of keys removed.
    async fn delete(&self, key: &str) -> StoreResult<u64>;

    /// Delete every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64>;

    /// Subscribe to changes of `key`, or of every key under it when
    /// `prefix` is set. Events are delivered from the moment the call
    /// returns.
    async fn watch(&self, key: &str, prefix: bool) -> StoreResult<WatchStream>;

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Renew a lease once. Fails with
    /// [`StoreError::LeaseNotFound`](crate::StoreError::LeaseNotFound)
    /// when the lease already expired.
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;

    /// Value of a key, without revision metadata.
    async fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.get(key).await?.map(|kv| kv.value))
    }
}
