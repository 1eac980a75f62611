//! Failure detection from machine liveness leases.
//!
//! A machine is alive while `machines/{m}/alive` exists. The key is bound
//! to the machine's lease, so the store deletes it when renewals stop.
//! The detector watches `machines/` and reacts to:
//!
//! - **alive deleted**: requeue the machine's non-global units, then
//!   delete the machine's remaining keys
//! - **alive created**: mirror global units onto the new machine
//!
//! Every (re)subscription first scans for machines whose alive key is
//! already gone, since deaths may predate the watch.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dispatch_machine::MachineRecord;
use dispatch_store::{StoreResult, WatchControl, WatchEvent, WatchHandler, run_watch};
use dispatch_unit::{Unit, UnitContext, UnitError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SupervisorResult;
use crate::globals::GlobalPropagator;

pub struct FailureDetector {
    ctx: UnitContext,
    globals: GlobalPropagator,
}

impl FailureDetector {
    pub fn new(ctx: UnitContext) -> Self {
        Self {
            globals: GlobalPropagator::new(ctx.clone()),
            ctx,
        }
    }

    /// Requeue the units of a dead machine and remove its record.
    ///
    /// Returns the names of the requeued units.
    pub async fn found_dead_machine(&self, machine: &str) -> SupervisorResult<Vec<String>> {
        let record = MachineRecord::load(self.ctx.store.as_ref(), &self.ctx.keys, machine).await?;
        let members: BTreeSet<String> = record.map(|r| r.units.into_iter().collect()).unwrap_or_default();

        let mut requeued = Vec::new();
        for mut unit in Unit::list_all(&self.ctx).await? {
            if unit.is_global() {
                continue;
            }
            let owned = match unit.machine.as_deref() {
                Some(m) => m == machine,
                None => members.contains(&unit.name),
            };
            if !owned {
                continue;
            }
            unit.put_on_queue(&self.ctx).await?;
            requeued.push(unit.name);
        }

        // Unreadable records would only be skipped forever; destroy them.
        for name in members.iter().filter(|name| !requeued.contains(*name)) {
            if let Err(UnitError::Corrupt(_, reason)) = Unit::load(&self.ctx, name).await {
                warn!(unit = %name, %reason, "corrupt unit on dead machine, destroying it");
                let global = self.ctx.store.get(&self.ctx.keys.global(name)).await?.is_some();
                Unit::purge(&self.ctx, name, global).await?;
            }
        }

        let removed = self.ctx.store.delete_prefix(&self.ctx.keys.machine(machine)).await?;
        info!(
            machine = %machine,
            requeued = requeued.len(),
            keys = removed,
            "machine dead, units requeued"
        );
        Ok(requeued)
    }

    /// Handle every machine that has a record but no liveness marker.
    pub async fn scan(&self) -> SupervisorResult<usize> {
        let mut dead = 0;
        for record in MachineRecord::list_all(self.ctx.store.as_ref(), &self.ctx.keys).await? {
            if !record.alive {
                self.found_dead_machine(&record.name).await?;
                dead += 1;
            }
        }
        Ok(dead)
    }

    /// Follow `machines/` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let prefix = self.ctx.keys.machines();
        let store = self.ctx.store.clone();
        let mut handler = LivenessWatch { detector: self };
        info!("failure detection started");
        run_watch(store.as_ref(), &prefix, true, &mut handler, &mut shutdown).await;
        info!("failure detection stopped");
    }
}

struct LivenessWatch {
    detector: Arc<FailureDetector>,
}

#[async_trait]
impl WatchHandler for LivenessWatch {
    async fn resync(&mut self) -> StoreResult<WatchControl> {
        match self.detector.scan().await {
            Ok(dead) => debug!(dead, "machine scan finished"),
            Err(e) => warn!(error = %e, "machine scan failed"),
        }
        Ok(WatchControl::Continue)
    }

    async fn on_event(&mut self, event: WatchEvent) -> WatchControl {
        let detector = &self.detector;
        let Some(machine) = detector.ctx.keys.alive_key_machine(event.key()) else {
            return WatchControl::Continue;
        };
        if event.is_delete() {
            if let Err(e) = detector.found_dead_machine(machine).await {
                warn!(machine = %machine, error = %e, "failed to handle dead machine");
            }
        } else if event.is_create() {
            info!(machine = %machine, "machine joined");
            if let Err(e) = detector.globals.assign_globals_to(machine).await {
                warn!(machine = %machine, error = %e, "failed to assign global units");
            }
        }
        WatchControl::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dispatch_store::keys;
    use dispatch_store::{CoordinationStore, EmbeddedStore, Keyspace};
    use dispatch_unit::{RecordingSupervisor, UnitFiles};

    use super::*;

    #[tokio::test]
    async fn dead_machine_units_are_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::open_in_memory().unwrap();
        let keys = Keyspace::new("z1");
        let ctx = UnitContext::new(
            Arc::new(store.clone()),
            keys.clone(),
            Arc::new(RecordingSupervisor::new()),
            UnitFiles::new(dir.path()),
            "m2",
        );

        let lease = store.grant_lease(Duration::from_secs(30)).await.unwrap();
        store.put(&keys.machine_alive("m1"), "m1", Some(lease)).await.unwrap();
        store.put(&keys.machine_field("m1", keys::MACHINE_LOAD), "0.1", None).await.unwrap();

        let mut web = Unit::new("web").unwrap();
        web.machine = Some("m1".into());
        web.save(&ctx).await.unwrap();
        store.put(&keys.machine_unit("m1", "web.service"), "web.service", None).await.unwrap();

        let mut other = Unit::new("db").unwrap();
        other.machine = Some("m9".into());
        other.save(&ctx).await.unwrap();

        let mut global = Unit::new("logs").unwrap().as_global();
        global.save(&ctx).await.unwrap();
        store.put(&keys.machine_unit("m1", "logs.service"), "logs.service", None).await.unwrap();

        let detector = Arc::new(FailureDetector::new(ctx.clone()));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(detector.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.expire_lease(lease);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(store.get(&keys.queue_entry("web.service")).await.unwrap().is_some());
        assert!(store.get(&keys.unit_field("web.service", keys::UNIT_MACHINE)).await.unwrap().is_none());
        assert!(store.get(&keys.queue_entry("db.service")).await.unwrap().is_none());
        assert!(store.get(&keys.queue_entry("logs.service")).await.unwrap().is_none());
        assert!(store.get_prefix(&keys.machine("m1")).await.unwrap().is_empty());

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn startup_scan_finds_earlier_deaths() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::open_in_memory().unwrap();
        let keys = Keyspace::new("z1");
        let ctx = UnitContext::new(
            Arc::new(store.clone()),
            keys.clone(),
            Arc::new(RecordingSupervisor::new()),
            UnitFiles::new(dir.path()),
            "m2",
        );

        // A record left behind with no liveness marker.
        store.put(&keys.machine_field("m1", keys::MACHINE_LOAD), "0.1", None).await.unwrap();
        store.put(&keys.machine_unit("m1", "web.service"), "web.service", None).await.unwrap();
        let mut web = Unit::new("web").unwrap();
        web.save(&ctx).await.unwrap();

        // Assigned there too, but unreadable.
        store.put(&keys.unit_field("bad.service", keys::UNIT_PORTS), "80", None).await.unwrap();
        store.put(&keys.machine_unit("m1", "bad.service"), "bad.service", None).await.unwrap();

        let detector = FailureDetector::new(ctx);
        assert_eq!(detector.scan().await.unwrap(), 1);
        assert!(store.get_prefix(&keys.unit("bad.service")).await.unwrap().is_empty());
        assert!(store.get(&keys.queue_entry("bad.service")).await.unwrap().is_none());
        assert!(store.get(&keys.queue_entry("web.service")).await.unwrap().is_some());
        assert!(store.get_prefix(&keys.machine("m1")).await.unwrap().is_empty());
    }
}
