//! EmbeddedStore — in-process coordination store.
//!
//! Implements the full [`CoordinationStore`] contract inside one process:
//! a revisioned key map, leases with deadlines that expire on their own
//! (emitting delete events, exactly like an etcd lease), and prefix
//! watches fanned out from a broadcast channel.
//!
//! Keys written without a lease are persisted to redb so a standalone
//! node keeps its units and templates across restarts. Lease-bound keys
//! (liveness markers, votes) are intentionally memory-only: after a
//! restart their owners must re-acquire them anyway.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::{
    CoordinationStore, EventKind, KeyValue, LeaseId, WatchEvent, WatchStream,
};

/// Lease-free keys, `key → value`.
const KEYS: TableDefinition<&str, &str> = TableDefinition::new("keys");

const EVENT_BUFFER: usize = 1024;
const WATCH_BUFFER: usize = 256;
const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

struct Entry {
    value: String,
    create_revision: i64,
    mod_revision: i64,
    lease: Option<LeaseId>,
}

impl Entry {
    fn to_kv(&self, key: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            lease: self.lease,
        }
    }
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    revision: i64,
    next_lease: LeaseId,
}

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    db: Database,
}

/// Cloneable handle to an in-process store.
#[derive(Clone)]
pub struct EmbeddedStore {
    shared: Arc<Shared>,
}

impl EmbeddedStore {
    /// Open (or create) a store persisted at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "embedded store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory embedded store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StoreResult<Self> {
        {
            // Opening a table in a write transaction creates it if absent.
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            txn.open_table(KEYS).map_err(map_err!(Table))?;
            txn.commit().map_err(map_err!(Transaction))?;
        }

        let mut state = State {
            next_lease: 1,
            ..State::default()
        };
        {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(KEYS).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                state.revision += 1;
                state.entries.insert(
                    key.value().to_string(),
                    Entry {
                        value: value.value().to_string(),
                        create_revision: state.revision,
                        mod_revision: state.revision,
                        lease: None,
                    },
                );
            }
        }

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            events,
            db,
        });

        // Without a runtime (plain #[test]) leases only expire on demand.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap_leases(Arc::downgrade(&shared)));
        }

        Ok(Self { shared })
    }

    /// Expire a lease immediately, as if its TTL had elapsed.
    ///
    /// Returns `false` if the lease does not exist.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        let mut state = self.shared.lock();
        match self.shared.revoke_locked(&mut state, lease) {
            Ok(found) => found,
            Err(e) => {
                warn!(lease, error = %e, "failed to expire lease");
                false
            }
        }
    }
}

async fn reap_leases(shared: Weak<Shared>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.expire_due();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: WatchEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn persist(&self, key: &str, value: Option<&str>) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KEYS).map_err(map_err!(Table))?;
            match value {
                Some(value) => {
                    table.insert(key, value).map_err(map_err!(Write))?;
                }
                None => {
                    table.remove(key).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_locked(
        &self,
        state: &mut State,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StoreResult<()> {
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        let prev = state.entries.get(key).map(|e| e.to_kv(key));
        let was_persisted = prev.as_ref().is_some_and(|p| p.lease.is_none());
        match lease {
            None => self.persist(key, Some(value))?,
            Some(_) if was_persisted => self.persist(key, None)?,
            Some(_) => {}
        }

        if let Some(old) = prev.as_ref().and_then(|p| p.lease) {
            if let Some(old_lease) = state.leases.get_mut(&old) {
                old_lease.keys.remove(key);
            }
        }
        if let Some(id) = lease {
            if let Some(new_lease) = state.leases.get_mut(&id) {
                new_lease.keys.insert(key.to_string());
            }
        }

        state.revision += 1;
        let entry = Entry {
            value: value.to_string(),
            create_revision: prev.as_ref().map_or(state.revision, |p| p.create_revision),
            mod_revision: state.revision,
            lease,
        };
        let kv = entry.to_kv(key);
        state.entries.insert(key.to_string(), entry);
        self.emit(WatchEvent {
            kind: EventKind::Put,
            kv,
            prev,
        });
        Ok(())
    }

    fn delete_locked(&self, state: &mut State, key: &str) -> StoreResult<bool> {
        let Some(entry) = state.entries.get(key) else {
            return Ok(false);
        };
        if entry.lease.is_none() {
            self.persist(key, None)?;
        }
        let Some(entry) = state.entries.remove(key) else {
            return Ok(false);
        };
        if let Some(id) = entry.lease {
            if let Some(lease) = state.leases.get_mut(&id) {
                lease.keys.remove(key);
            }
        }

        state.revision += 1;
        self.emit(WatchEvent {
            kind: EventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: String::new(),
                create_revision: 0,
                mod_revision: state.revision,
                lease: None,
            },
            prev: Some(entry.to_kv(key)),
        });
        Ok(true)
    }

    fn revoke_locked(&self, state: &mut State, id: LeaseId) -> StoreResult<bool> {
        let Some(lease) = state.leases.remove(&id) else {
            return Ok(false);
        };
        for key in &lease.keys {
            self.delete_locked(state, key)?;
        }
        debug!(lease = id, keys = lease.keys.len(), "lease revoked");
        Ok(true)
    }

    fn expire_due(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        let due: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            debug!(lease = id, "lease expired");
            if let Err(e) = self.revoke_locked(&mut state, id) {
                warn!(lease = id, error = %e, "failed to expire lease");
            }
        }
    }
}

fn keys_with_prefix(state: &State, prefix: &str) -> Vec<String> {
    state
        .entries
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, _)| key.clone())
        .collect()
}

#[async_trait]
impl CoordinationStore for EmbeddedStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut state = self.shared.lock();
        self.shared.put_locked(&mut state, key, value, lease)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool> {
        let mut state = self.shared.lock();
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        self.shared.put_locked(&mut state, key, value, lease)?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let state = self.shared.lock();
        Ok(state.entries.get(key).map(|e| e.to_kv(key)))
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let state = self.shared.lock();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| entry.to_kv(key))
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let mut state = self.shared.lock();
        Ok(u64::from(self.shared.delete_locked(&mut state, key)?))
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut state = self.shared.lock();
        let mut deleted = 0;
        for key in keys_with_prefix(&state, prefix) {
            if self.shared.delete_locked(&mut state, &key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn watch(&self, key: &str, prefix: bool) -> StoreResult<WatchStream> {
        let mut events = self.shared.events.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let key = key.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            let matched = if prefix {
                                event.key().starts_with(&key)
                            } else {
                                event.key() == key
                            };
                            if matched && tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%key, skipped, "watch fell behind, closing stream");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(WatchStream::new(rx))
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut state = self.shared.lock();
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.shared.lock();
        let now = Instant::now();
        match state.leases.get_mut(&lease) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = now + entry.ttl;
                Ok(())
            }
            Some(_) => {
                self.shared.revoke_locked(&mut state, lease)?;
                Err(StoreError::LeaseNotFound(lease))
            }
            None => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.shared.lock();
        self.shared.revoke_locked(&mut state, lease)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> EmbeddedStore {
        EmbeddedStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = test_store();
        store.put("/a/x", "1", None).await.unwrap();
        store.put("/a/y", "2", None).await.unwrap();
        store.put("/b/z", "3", None).await.unwrap();

        assert_eq!(store.get_value("/a/x").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get_prefix("/a/").await.unwrap().len(), 2);
        assert_eq!(store.delete("/a/x").await.unwrap(), 1);
        assert_eq!(store.delete("/a/x").await.unwrap(), 0);
        assert_eq!(store.delete_prefix("/a/").await.unwrap(), 1);
        assert!(store.get_prefix("/a/").await.unwrap().is_empty());
        assert!(store.get("/b/z").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revisions_track_creation() {
        let store = test_store();
        store.put("/k", "1", None).await.unwrap();
        let first = store.get("/k").await.unwrap().unwrap();
        assert_eq!(first.create_revision, first.mod_revision);

        store.put("/k", "2", None).await.unwrap();
        let second = store.get("/k").await.unwrap().unwrap();
        assert_eq!(second.create_revision, first.create_revision);
        assert!(second.mod_revision > first.mod_revision);
    }

    #[tokio::test]
    async fn put_if_absent_only_creates_once() {
        let store = test_store();
        assert!(store.put_if_absent("/vote", "m1", None).await.unwrap());
        assert!(!store.put_if_absent("/vote", "m2", None).await.unwrap());
        assert_eq!(store.get_value("/vote").await.unwrap().as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn expired_lease_deletes_keys_and_notifies() {
        let store = test_store();
        let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("/m/alive", "m1", Some(lease)).await.unwrap();

        let mut watch = store.watch("/m/", true).await.unwrap();
        assert!(store.expire_lease(lease));

        let event = watch.next().await.unwrap();
        assert!(event.is_delete());
        assert_eq!(event.key(), "/m/alive");
        assert_eq!(event.prev_value(), Some("m1"));
        assert!(store.get("/m/alive").await.unwrap().is_none());
        assert!(matches!(
            store.keep_alive(lease).await,
            Err(StoreError::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn lease_expires_on_its_own() {
        let store = test_store();
        let lease = store.grant_lease(Duration::from_millis(200)).await.unwrap();
        store.put("/alive", "x", Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.get("/alive").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keep_alive_extends_lease() {
        let store = test_store();
        let lease = store.grant_lease(Duration::from_millis(300)).await.unwrap();
        store.put("/alive", "x", Some(lease)).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.keep_alive(lease).await.unwrap();
        }
        assert!(store.get("/alive").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let store = test_store();
        let result = store.put("/k", "v", Some(42)).await;
        assert!(matches!(result, Err(StoreError::LeaseNotFound(42))));
    }

    #[tokio::test]
    async fn watch_filters_by_key_and_prefix() {
        let store = test_store();
        let mut exact = store.watch("/u/a/state", false).await.unwrap();
        let mut prefix = store.watch("/u/a/", true).await.unwrap();

        store.put("/u/ab/state", "x", None).await.unwrap();
        store.put("/u/a/name", "a", None).await.unwrap();
        store.put("/u/a/state", "active", None).await.unwrap();

        let event = exact.next().await.unwrap();
        assert_eq!(event.key(), "/u/a/state");
        assert!(event.is_create());

        assert_eq!(prefix.next().await.unwrap().key(), "/u/a/name");
        assert_eq!(prefix.next().await.unwrap().key(), "/u/a/state");
    }

    #[test]
    fn lease_free_keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.redb");

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = EmbeddedStore::open(&path).unwrap();
            let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
            store.put("/units/u1/name", "u1", None).await.unwrap();
            store.put("/machines/m1/alive", "m1", Some(lease)).await.unwrap();
            store.put("/tmp", "x", None).await.unwrap();
            store.delete("/tmp").await.unwrap();
        });
        drop(rt);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = EmbeddedStore::open(&path).unwrap();
            assert_eq!(
                store.get_value("/units/u1/name").await.unwrap().as_deref(),
                Some("u1")
            );
            assert!(store.get("/machines/m1/alive").await.unwrap().is_none());
            assert!(store.get("/tmp").await.unwrap().is_none());
        });
    }
}
