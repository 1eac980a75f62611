//! Self-healing watch loops.
//!
//! A watch loop subscribes, resyncs from a full read, then applies events
//! until the stream ends or the handler asks to stop. Stream termination
//! (disconnect, compaction, a lagging consumer) is a normal event: the
//! loop backs off briefly, resubscribes and resyncs again. Subscribing
//! before the resync read means no change can fall between the two.
//!
//! A handler that could not apply a change returns
//! [`WatchControl::Retry`]; the loop takes the same path as a lost
//! stream, so the next resync re-reads the current value and tries again.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::store::{CoordinationStore, WatchEvent};

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Whether a watch loop keeps running after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchControl {
    Continue,
    Stop,
    /// Back off, resubscribe and resync.
    Retry,
}

/// Callbacks driven by [`run_watch`].
#[async_trait]
pub trait WatchHandler: Send {
    /// Re-derive state from a full read. Runs after every (re)subscription.
    async fn resync(&mut self) -> StoreResult<WatchControl>;

    /// Apply one event.
    async fn on_event(&mut self, event: WatchEvent) -> WatchControl;
}

/// Drive `handler` over the watch on `key` until it stops or `shutdown` fires.
pub async fn run_watch<H>(
    store: &dyn CoordinationStore,
    key: &str,
    prefix: bool,
    handler: &mut H,
    shutdown: &mut watch::Receiver<bool>,
) where
    H: WatchHandler + ?Sized,
{
    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut stream = match store.watch(key, prefix).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%key, error = %e, "watch subscribe failed");
                if backoff(shutdown).await {
                    return;
                }
                continue;
            }
        };

        match handler.resync().await {
            Ok(WatchControl::Continue) => {}
            Ok(WatchControl::Stop) => return,
            Ok(WatchControl::Retry) => {
                debug!(%key, "resync asked for a retry");
                if backoff(shutdown).await {
                    return;
                }
                continue;
            }
            Err(e) => {
                warn!(%key, error = %e, "watch resync failed");
                if backoff(shutdown).await {
                    return;
                }
                continue;
            }
        }

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(event) => match handler.on_event(event).await {
                        WatchControl::Continue => {}
                        WatchControl::Stop => return,
                        WatchControl::Retry => {
                            debug!(%key, "event handler asked for a retry");
                            break;
                        }
                    },
                    None => {
                        debug!(%key, "watch stream ended, resubscribing");
                        break;
                    }
                },
                _ = shutdown.changed() => return,
            }
        }

        if backoff(shutdown).await {
            return;
        }
    }
}

/// Sleep before resubscribing. Returns `true` if shutdown fired meanwhile.
async fn backoff(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => false,
        _ = shutdown.changed() => true,
    }
}
