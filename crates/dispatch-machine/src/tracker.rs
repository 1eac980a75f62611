//! Locally tracked units — one supervision task per assigned unit.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dispatch_unit::{Unit, UnitContext, UnitError};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MachineResult;

/// Per-unit supervision task.
struct UnitSlot {
    /// Handle to the supervise task.
    handle: JoinHandle<()>,
    /// Shutdown signal for this unit.
    shutdown_tx: watch::Sender<bool>,
    global: bool,
}

/// The set of units this machine is currently running.
#[derive(Clone)]
pub struct UnitTracker {
    ctx: UnitContext,
    /// Active slots: unit name → slot.
    slots: Arc<RwLock<HashMap<String, UnitSlot>>>,
}

impl UnitTracker {
    pub fn new(ctx: UnitContext) -> Self {
        Self {
            ctx,
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start supervising an assigned unit unless a live task already does.
    ///
    /// Returns `true` when a new task was spawned.
    pub async fn track(&self, name: &str) -> MachineResult<bool> {
        if self.is_tracked(name).await {
            return Ok(false);
        }
        let unit = match Unit::load(&self.ctx, name).await {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                debug!(unit = %name, "assigned unit has no record");
                return Ok(false);
            }
            Err(UnitError::Corrupt(_, reason)) => {
                self.destroy_corrupt(name, &reason).await?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let mut slots = self.slots.write().await;
        if slots.get(name).is_some_and(|slot| !slot.handle.is_finished()) {
            return Ok(false);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let global = unit.is_global();
        let handle = tokio::spawn(unit.supervise(self.ctx.clone(), shutdown_rx));
        slots.insert(
            name.to_string(),
            UnitSlot {
                handle,
                shutdown_tx,
                global,
            },
        );
        info!(unit = %name, global, "tracking unit");
        Ok(true)
    }

    /// A record that cannot be read is never going to converge: remove
    /// the local artifact and every key of the unit.
    async fn destroy_corrupt(&self, name: &str, reason: &str) -> MachineResult<()> {
        warn!(unit = %name, %reason, "assigned unit record is corrupt, destroying it");
        Unit::teardown(&self.ctx, name).await;
        let global = self
            .ctx
            .store
            .get(&self.ctx.keys.global(name))
            .await?
            .is_some();
        Unit::purge(&self.ctx, name, global).await?;
        Ok(())
    }

    /// Stop supervising a unit and tear it down locally.
    ///
    /// The store is not touched: the unit may already run elsewhere.
    pub async fn untrack(&self, name: &str) -> bool {
        let slot = self.slots.write().await.remove(name);
        let tracked = match slot {
            Some(slot) => {
                let _ = slot.shutdown_tx.send(true);
                slot.handle.abort();
                true
            }
            None => false,
        };
        Unit::teardown(&self.ctx, name).await;
        if tracked {
            info!(unit = %name, "stopped tracking unit");
        }
        tracked
    }

    /// Whether a live supervision task exists for the unit.
    pub async fn is_tracked(&self, name: &str) -> bool {
        self.slots
            .read()
            .await
            .get(name)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Names of all slots, sorted.
    pub async fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Reconcile local tasks with the assigned set: track every assigned
    /// unit, untrack non-global units that are no longer assigned, and
    /// drop finished slots of unassigned units.
    pub async fn sync(&self, assigned: &BTreeSet<String>) {
        for name in assigned {
            if let Err(e) = self.track(name).await {
                warn!(unit = %name, error = %e, "failed to track assigned unit");
            }
        }

        let stale: Vec<String> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|(name, slot)| {
                !assigned.contains(*name) && (!slot.global || slot.handle.is_finished())
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            self.untrack(&name).await;
        }
    }

    /// Untrack and tear down every unit.
    pub async fn shutdown(&self) {
        for name in self.tracked().await {
            self.untrack(&name).await;
        }
    }
}
