//! Scheduler — assigns queued units to machines.
//!
//! Runs only on the elected supervisor. A pass is triggered by a timer
//! and by every new queue entry; passes never overlap. Each pass:
//!
//! 1. snapshots `units/` into a read-through cache
//! 2. builds a candidate per live machine with a published load
//! 3. for every queued unit, oldest first, selects the lowest-load
//!    machine that passes the port, density and tag checks
//! 4. commits: `units/{u}/machine`, then `machines/{m}/units/{u}`,
//!    then deletes `queue/{u}`
//!
//! A crash between steps of the commit leaves the queue entry in place,
//! so the next pass simply re-runs the assignment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_machine::MachineRecord;
use dispatch_placement::{MachineCandidate, PlacementRequest, UnitFootprint, select_machine};
use dispatch_store::keys;
use dispatch_store::{StoreCache, StoreResult, WatchControl, WatchEvent, WatchHandler, run_watch};
use dispatch_unit::{Template, Unit, UnitContext, UnitError};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::SupervisorResult;
use crate::queue::UnitQueue;

/// Outcome of scheduling one queued unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Newly assigned to the machine.
    Assigned(String),
    /// Already held by a live machine; only the queue entry was dropped.
    AlreadyAssigned(String),
    /// No machine qualifies; the unit stays queued.
    Pending,
    /// Missing, global or corrupt record; the entry was discarded.
    Dropped,
}

pub struct Scheduler {
    ctx: UnitContext,
    queue: UnitQueue,
    interval: Duration,
    pass_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(ctx: UnitContext) -> Self {
        Self {
            queue: UnitQueue::new(ctx.clone()),
            ctx,
            interval: Duration::from_secs(5),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one scheduling pass over the whole queue.
    pub async fn schedule_pending(&self) -> SupervisorResult<Vec<(String, Placement)>> {
        let _pass = self.pass_lock.lock().await;

        let pending = self.queue.pending().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut cache = StoreCache::for_prefix(self.ctx.store.clone(), &self.ctx.keys.units()).await?;
        cache.load_prefix(&self.ctx.keys.templates()).await?;
        let mut machines = self.candidates(&mut cache).await?;
        debug!(queued = pending.len(), machines = machines.len(), "scheduling pass");

        let mut results = Vec::with_capacity(pending.len());
        for name in pending {
            let placement = self.schedule_one(&mut cache, &mut machines, &name).await?;
            results.push((name, placement));
        }
        Ok(results)
    }

    /// Live machines with a published load, and what they hold.
    async fn candidates(&self, cache: &mut StoreCache) -> SupervisorResult<Vec<MachineCandidate>> {
        let records = MachineRecord::list_alive(self.ctx.store.as_ref(), &self.ctx.keys).await?;
        let mut machines = Vec::with_capacity(records.len());
        for record in records {
            let Some(load) = record.load else {
                debug!(machine = %record.name, "no load published yet, skipping");
                continue;
            };
            let mut units = Vec::with_capacity(record.units.len());
            for name in &record.units {
                match Unit::load_cached(&self.ctx, cache, name).await {
                    Ok(Some(unit)) => units.push(footprint(&unit)),
                    Ok(None) => {}
                    Err(e) => debug!(unit = %name, error = %e, "unreadable assigned unit ignored"),
                }
            }
            machines.push(MachineCandidate {
                name: record.name,
                load,
                tags: record.tags,
                units,
            });
        }
        Ok(machines)
    }

    async fn schedule_one(
        &self,
        cache: &mut StoreCache,
        machines: &mut [MachineCandidate],
        name: &str,
    ) -> SupervisorResult<Placement> {
        let unit = match Unit::load_cached(&self.ctx, cache, name).await {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                debug!(unit = %name, "queued unit no longer exists");
                self.queue.remove(name).await?;
                return Ok(Placement::Dropped);
            }
            Err(UnitError::Corrupt(_, reason)) => {
                warn!(unit = %name, %reason, "destroying corrupt unit record");
                Unit::purge(&self.ctx, name, false).await?;
                cache.invalidate_prefix(&self.ctx.keys.unit(name));
                return Ok(Placement::Dropped);
            }
            Err(e) => return Err(e.into()),
        };

        if unit.is_global() {
            debug!(unit = %name, "global unit on queue, dropping entry");
            self.queue.remove(name).await?;
            return Ok(Placement::Dropped);
        }

        if let Some(current) = &unit.machine {
            let held = machines
                .iter()
                .any(|m| &m.name == current && m.units.iter().any(|u| u.name == unit.name));
            if held {
                debug!(unit = %name, machine = %current, "unit already assigned");
                self.queue.remove(name).await?;
                return Ok(Placement::AlreadyAssigned(current.clone()));
            }
        }

        let max_per_machine = match &unit.template {
            Some(template) => Template::load_cached(cache, &self.ctx.keys, template)
                .await?
                .map_or(0, |t| t.max_per_machine),
            None => 0,
        };
        let request = PlacementRequest {
            unit: unit.name.clone(),
            ports: unit.ports.clone(),
            template: unit.template.clone(),
            max_per_machine,
            constraints: unit.constraints.clone(),
        };

        let Some(target) = select_machine(machines, &request).map(|m| m.name.clone()) else {
            debug!(unit = %name, "no qualifying machine, unit stays queued");
            return Ok(Placement::Pending);
        };

        self.commit(&unit.name, &target).await?;
        cache.put(&self.ctx.keys.unit_field(&unit.name, keys::UNIT_MACHINE), &target);
        if let Some(machine) = machines.iter_mut().find(|m| m.name == target) {
            machine.units.push(footprint(&unit));
        }
        info!(unit = %name, machine = %target, "unit assigned");
        Ok(Placement::Assigned(target))
    }

    /// Assignment first, queue entry last.
    async fn commit(&self, unit: &str, machine: &str) -> StoreResult<()> {
        let store = &self.ctx.store;
        store
            .put(&self.ctx.keys.unit_field(unit, keys::UNIT_MACHINE), machine, None)
            .await?;
        store
            .put(&self.ctx.keys.machine_unit(machine, unit), unit, None)
            .await?;
        store.delete(&self.ctx.keys.queue_entry(unit)).await?;
        Ok(())
    }

    async fn pass(&self) {
        match self.schedule_pending().await {
            Ok(results) => {
                let pending = results.iter().filter(|(_, p)| *p == Placement::Pending).count();
                if !results.is_empty() {
                    debug!(handled = results.len(), pending, "scheduling pass finished");
                }
            }
            Err(e) => warn!(error = %e, "scheduling pass failed"),
        }
    }

    /// Schedule on a timer and on new queue entries until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let watcher = tokio::spawn(self.clone().watch_queue(shutdown.clone()));
        let mut interval = tokio::time::interval(self.interval);
        info!("scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.pass().await,
                _ = shutdown.changed() => break,
            }
        }
        let _ = watcher.await;
        info!("scheduler stopped");
    }

    async fn watch_queue(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let prefix = self.ctx.keys.queue();
        let store = self.ctx.store.clone();
        let mut handler = QueueWatch { scheduler: self };
        run_watch(store.as_ref(), &prefix, true, &mut handler, &mut shutdown).await;
    }
}

fn footprint(unit: &Unit) -> UnitFootprint {
    UnitFootprint {
        name: unit.name.clone(),
        template: unit.template.clone(),
        ports: unit.ports.clone(),
    }
}

struct QueueWatch {
    scheduler: Arc<Scheduler>,
}

#[async_trait]
impl WatchHandler for QueueWatch {
    async fn resync(&mut self) -> StoreResult<WatchControl> {
        self.scheduler.pass().await;
        Ok(WatchControl::Continue)
    }

    async fn on_event(&mut self, event: WatchEvent) -> WatchControl {
        if event.is_create() {
            self.scheduler.pass().await;
        }
        WatchControl::Continue
    }
}

#[cfg(test)]
mod tests {
    use dispatch_store::{CoordinationStore, EmbeddedStore, Keyspace};
    use dispatch_unit::{RecordingSupervisor, UnitFiles};

    use super::*;

    struct Fixture {
        store: EmbeddedStore,
        ctx: UnitContext,
        scheduler: Scheduler,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::open_in_memory().unwrap();
        let ctx = UnitContext::new(
            Arc::new(store.clone()),
            Keyspace::new("z1"),
            Arc::new(RecordingSupervisor::new()),
            UnitFiles::new(dir.path()),
            "m1",
        );
        Fixture {
            scheduler: Scheduler::new(ctx.clone()),
            store,
            ctx,
            _dir: dir,
        }
    }

    async fn machine(f: &Fixture, name: &str, load: &str) {
        let keys = &f.ctx.keys;
        let lease = f.store.grant_lease(Duration::from_secs(30)).await.unwrap();
        f.store.put(&keys.machine_alive(name), name, Some(lease)).await.unwrap();
        f.store
            .put(&keys.machine_field(name, keys::MACHINE_LOAD), load, None)
            .await
            .unwrap();
    }

    async fn submit(f: &Fixture, mut unit: Unit) {
        UnitQueue::new(f.ctx.clone()).submit(&mut unit).await.unwrap();
    }

    #[tokio::test]
    async fn lowest_load_machine_is_chosen() {
        let f = fixture();
        machine(&f, "m1", "0.2").await;
        machine(&f, "m2", "0.5").await;
        submit(&f, Unit::new("u1").unwrap().with_ports([80])).await;

        let results = f.scheduler.schedule_pending().await.unwrap();
        assert_eq!(
            results,
            vec![("u1.service".to_string(), Placement::Assigned("m1".into()))]
        );

        let keys = &f.ctx.keys;
        assert_eq!(
            f.store.get_value(&keys.unit_field("u1.service", keys::UNIT_MACHINE)).await.unwrap().as_deref(),
            Some("m1")
        );
        assert!(f.store.get(&keys.machine_unit("m1", "u1.service")).await.unwrap().is_some());
        assert!(f.store.get(&keys.queue_entry("u1.service")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn units_in_one_pass_see_earlier_assignments() {
        let f = fixture();
        machine(&f, "m1", "0.1").await;
        machine(&f, "m2", "0.9").await;
        submit(&f, Unit::new("a").unwrap().with_ports([80])).await;
        submit(&f, Unit::new("b").unwrap().with_ports([80])).await;

        let results = f.scheduler.schedule_pending().await.unwrap();
        assert_eq!(results[0].1, Placement::Assigned("m1".into()));
        assert_eq!(results[1].1, Placement::Assigned("m2".into()));
    }

    #[tokio::test]
    async fn unsatisfiable_units_stay_queued() {
        let f = fixture();
        machine(&f, "m1", "0.1").await;
        submit(&f, Unit::new("web").unwrap().with_constraint("disk", "ssd")).await;

        let results = f.scheduler.schedule_pending().await.unwrap();
        assert_eq!(results[0].1, Placement::Pending);
        assert!(f.store.get(&f.ctx.keys.queue_entry("web.service")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn machines_without_load_are_skipped() {
        let f = fixture();
        let lease = f.store.grant_lease(Duration::from_secs(30)).await.unwrap();
        f.store.put(&f.ctx.keys.machine_alive("m1"), "m1", Some(lease)).await.unwrap();
        submit(&f, Unit::new("web").unwrap()).await;

        let results = f.scheduler.schedule_pending().await.unwrap();
        assert_eq!(results[0].1, Placement::Pending);
    }

    #[tokio::test]
    async fn duplicate_dequeue_is_harmless() {
        let f = fixture();
        machine(&f, "m1", "0.1").await;
        submit(&f, Unit::new("web").unwrap()).await;
        f.scheduler.schedule_pending().await.unwrap();

        // A retried pass finds the queue entry again.
        f.store
            .put(&f.ctx.keys.queue_entry("web.service"), "web.service", None)
            .await
            .unwrap();
        let results = f.scheduler.schedule_pending().await.unwrap();
        assert_eq!(results[0].1, Placement::AlreadyAssigned("m1".into()));
        assert!(f.store.get(&f.ctx.keys.queue_entry("web.service")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_and_missing_records_are_dropped() {
        let f = fixture();
        machine(&f, "m1", "0.1").await;
        let keys = &f.ctx.keys;
        f.store.put(&keys.queue_entry("ghost.service"), "ghost.service", None).await.unwrap();
        f.store.put(&keys.queue_entry("bad.service"), "bad.service", None).await.unwrap();
        f.store
            .put(&keys.unit_field("bad.service", keys::UNIT_PORTS), "80", None)
            .await
            .unwrap();

        let results = f.scheduler.schedule_pending().await.unwrap();
        assert!(results.iter().all(|(_, p)| *p == Placement::Dropped));
        assert!(f.store.get_prefix(&keys.unit("bad.service")).await.unwrap().is_empty());
        assert!(f.store.get_prefix(&keys.queue()).await.unwrap().is_empty());
    }
}
