//! Global unit propagation.
//!
//! A global unit is declared under `globals/{u}` and never queued.
//! The propagator mirrors it onto every live machine by writing
//! `machines/{m}/units/{u}`, and removes every copy when the declaration
//! goes away.

use std::sync::Arc;

use async_trait::async_trait;
use dispatch_machine::MachineRecord;
use dispatch_store::keys::{self, child_name};
use dispatch_store::{StoreResult, WatchControl, WatchEvent, WatchHandler, run_watch};
use dispatch_unit::UnitContext;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SupervisorResult;

#[derive(Clone)]
pub struct GlobalPropagator {
    ctx: UnitContext,
}

impl GlobalPropagator {
    pub fn new(ctx: UnitContext) -> Self {
        Self { ctx }
    }

    /// Names of all declared global units.
    pub async fn declared(&self) -> StoreResult<Vec<String>> {
        let prefix = self.ctx.keys.globals();
        Ok(self
            .ctx
            .store
            .get_prefix(&prefix)
            .await?
            .iter()
            .filter_map(|kv| child_name(&prefix, &kv.key).map(str::to_string))
            .collect())
    }

    async fn live_machines(&self) -> StoreResult<Vec<String>> {
        Ok(MachineRecord::list_alive(self.ctx.store.as_ref(), &self.ctx.keys)
            .await?
            .into_iter()
            .map(|m| m.name)
            .collect())
    }

    /// Write the membership key unless it exists. Returns `true` if written.
    async fn assign(&self, unit: &str, machine: &str) -> StoreResult<bool> {
        let created = self
            .ctx
            .store
            .put_if_absent(&self.ctx.keys.machine_unit(machine, unit), unit, None)
            .await?;
        if created {
            info!(unit = %unit, machine = %machine, "global unit assigned");
        }
        Ok(created)
    }

    /// Mirror every declared global unit onto `machine`.
    pub async fn assign_globals_to(&self, machine: &str) -> SupervisorResult<usize> {
        let mut assigned = 0;
        for unit in self.declared().await? {
            if self.assign(&unit, machine).await? {
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    /// Mirror one global unit onto every live machine.
    pub async fn propagate(&self, unit: &str) -> SupervisorResult<usize> {
        let mut assigned = 0;
        for machine in self.live_machines().await? {
            if self.assign(unit, &machine).await? {
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    /// Remove a global unit from every machine.
    pub async fn withdraw(&self, unit: &str) -> SupervisorResult<usize> {
        let suffix = format!("/{}/{unit}", keys::MACHINE_UNITS);
        let memberships: Vec<String> = self
            .ctx
            .store
            .get_prefix(&self.ctx.keys.machines())
            .await?
            .into_iter()
            .map(|kv| kv.key)
            .filter(|key| key.ends_with(&suffix))
            .collect();
        for key in &memberships {
            self.ctx.store.delete(key).await?;
        }
        if !memberships.is_empty() {
            info!(unit = %unit, machines = memberships.len(), "global unit withdrawn");
        }
        Ok(memberships.len())
    }

    /// Mirror every declared global unit onto every live machine.
    pub async fn sync_all(&self) -> SupervisorResult<usize> {
        let machines = self.live_machines().await?;
        let mut assigned = 0;
        for unit in self.declared().await? {
            for machine in &machines {
                if self.assign(&unit, machine).await? {
                    assigned += 1;
                }
            }
        }
        Ok(assigned)
    }

    /// Follow `globals/` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let prefix = self.ctx.keys.globals();
        let store = self.ctx.store.clone();
        let mut handler = GlobalsWatch {
            propagator: self,
            prefix: prefix.clone(),
        };
        info!("global propagation started");
        run_watch(store.as_ref(), &prefix, true, &mut handler, &mut shutdown).await;
        info!("global propagation stopped");
    }
}

struct GlobalsWatch {
    propagator: Arc<GlobalPropagator>,
    prefix: String,
}

#[async_trait]
impl WatchHandler for GlobalsWatch {
    async fn resync(&mut self) -> StoreResult<WatchControl> {
        match self.propagator.sync_all().await {
            Ok(assigned) => debug!(assigned, "global units resynced"),
            Err(e) => warn!(error = %e, "global resync failed"),
        }
        Ok(WatchControl::Continue)
    }

    async fn on_event(&mut self, event: WatchEvent) -> WatchControl {
        let Some(unit) = child_name(&self.prefix, event.key()) else {
            return WatchControl::Continue;
        };
        let result = if event.is_delete() {
            self.propagator.withdraw(unit).await
        } else {
            self.propagator.propagate(unit).await
        };
        if let Err(e) = result {
            warn!(unit = %unit, error = %e, "global propagation failed");
        }
        WatchControl::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dispatch_store::{CoordinationStore, EmbeddedStore, Keyspace};
    use dispatch_unit::{RecordingSupervisor, Unit, UnitFiles};

    use super::*;

    async fn alive(store: &EmbeddedStore, keys: &Keyspace, name: &str) {
        let lease = store.grant_lease(Duration::from_secs(30)).await.unwrap();
        store.put(&keys.machine_alive(name), name, Some(lease)).await.unwrap();
    }

    #[tokio::test]
    async fn globals_follow_declarations() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::open_in_memory().unwrap();
        let keys = Keyspace::new("z1");
        let ctx = UnitContext::new(
            Arc::new(store.clone()),
            keys.clone(),
            Arc::new(RecordingSupervisor::new()),
            UnitFiles::new(dir.path()),
            "m1",
        );
        alive(&store, &keys, "m1").await;
        alive(&store, &keys, "m2").await;

        let propagator = Arc::new(GlobalPropagator::new(ctx.clone()));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(propagator.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut unit = Unit::new("logs").unwrap().as_global();
        unit.save(&ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        for m in ["m1", "m2"] {
            assert!(store.get(&keys.machine_unit(m, "logs.service")).await.unwrap().is_some());
        }

        alive(&store, &keys, "m3").await;
        assert_eq!(propagator.assign_globals_to("m3").await.unwrap(), 1);
        assert_eq!(propagator.assign_globals_to("m3").await.unwrap(), 0);

        store.delete(&keys.global("logs.service")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        for m in ["m1", "m2", "m3"] {
            assert!(store.get(&keys.machine_unit(m, "logs.service")).await.unwrap().is_none());
        }

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
