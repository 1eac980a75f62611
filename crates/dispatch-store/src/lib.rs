//! dispatch-store — coordination store access for dispatch.
//!
//! The cluster has no agent-to-agent RPC: every machine reads, writes and
//! watches one shared key space. This crate owns that boundary.
//!
//! # Architecture
//!
//! ```text
//!   components ──► SharedStore (Arc<dyn CoordinationStore>)
//!                      │
//!          ┌───────────┴────────────┐
//!          ▼                        ▼
//!      EtcdStore               EmbeddedStore
//!   (etcd-client, prod)   (in-process, redb-backed)
//! ```
//!
//! - **`store`** — the contract: put/get/delete, prefix ops, leases,
//!   create-if-absent, watches
//! - **`keys`** — zone-scoped key layout
//! - **`codec`** — text encodings for ports and `k=v` maps
//! - **`cache`** — read-through snapshot for one scheduling pass
//! - **`watch`** — resubscribing watch-loop driver

pub mod cache;
pub mod codec;
pub mod embedded;
pub mod error;
pub mod etcd;
pub mod keys;
pub mod store;
pub mod watch;

pub use cache::StoreCache;
pub use embedded::EmbeddedStore;
pub use error::{StoreError, StoreResult};
pub use etcd::EtcdStore;
pub use keys::Keyspace;
pub use store::{
    CoordinationStore, EventKind, KeyValue, LeaseId, SharedStore, WatchEvent, WatchStream,
};
pub use watch::{WatchControl, WatchHandler, run_watch};
