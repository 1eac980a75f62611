//! EtcdStore — the production backend over `etcd-client`.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions,
    PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::{
    CoordinationStore, EventKind, KeyValue, LeaseId, WatchEvent, WatchStream,
};

const WATCH_BUFFER: usize = 256;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Coordination store backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the given etcd endpoints.
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_secs(5))
            .with_keep_alive(Duration::from_secs(5), Duration::from_secs(5));
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(map_err!(Connect))?;
        info!(?endpoints, "connected to etcd");
        Ok(Self { client })
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> StoreResult<KeyValue> {
    Ok(KeyValue {
        key: kv.key_str().map_err(map_err!(Encoding))?.to_string(),
        value: kv.value_str().map_err(map_err!(Encoding))?.to_string(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: (kv.lease() != 0).then_some(kv.lease()),
    })
}

fn convert_event(event: &etcd_client::Event) -> StoreResult<Option<WatchEvent>> {
    let Some(kv) = event.kv() else {
        return Ok(None);
    };
    let kind = match event.event_type() {
        EventType::Put => EventKind::Put,
        EventType::Delete => EventKind::Delete,
    };
    Ok(Some(WatchEvent {
        kind,
        kv: convert_kv(kv)?,
        prev: event.prev_kv().map(convert_kv).transpose()?,
    }))
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client
            .put(key, value, options)
            .await
            .map_err(map_err!(Request))?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, options)]);
        let response = client.txn(txn).await.map_err(map_err!(Request))?;
        Ok(response.succeeded())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let mut client = self.client.clone();
        let response = client.get(key, None).await.map_err(map_err!(Request))?;
        response.kvs().first().map(convert_kv).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err!(Request))?;
        response.kvs().iter().map(convert_kv).collect()
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let mut client = self.client.clone();
        let response = client.delete(key, None).await.map_err(map_err!(Request))?;
        Ok(response.deleted().max(0) as u64)
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut client = self.client.clone();
        let response = client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(map_err!(Request))?;
        Ok(response.deleted().max(0) as u64)
    }

    async fn watch(&self, key: &str, prefix: bool) -> StoreResult<WatchStream> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prev_key();
        if prefix {
            options = options.with_prefix();
        }
        let (watcher, mut stream) = client
            .watch(key, Some(options))
            .await
            .map_err(map_err!(Request))?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let key = key.to_string();
        tokio::spawn(async move {
            // Dropping the watcher cancels the server-side watch.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    message = stream.message() => match message {
                        Ok(Some(response)) => {
                            if response.canceled() {
                                warn!(%key, reason = response.cancel_reason(), "etcd canceled watch");
                                break;
                            }
                            for event in response.events() {
                                match convert_event(event) {
                                    Ok(Some(event)) => {
                                        if tx.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(e) => warn!(%key, error = %e, "skipping undecodable watch event"),
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(%key, "etcd watch stream closed");
                            break;
                        }
                        Err(e) => {
                            warn!(%key, error = %e, "etcd watch stream failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(WatchStream::new(rx))
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut client = self.client.clone();
        let ttl_secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let response = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(map_err!(Request))?;
        Ok(response.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(map_err!(Request))?;
        keeper.keep_alive().await.map_err(map_err!(Request))?;
        match stream.message().await.map_err(map_err!(Request))? {
            Some(response) if response.ttl() > 0 => Ok(()),
            _ => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease)
            .await
            .map_err(map_err!(Request))?;
        Ok(())
    }
}
