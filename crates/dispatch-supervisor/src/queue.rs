//! The placement queue under `queue/`.
//!
//! An entry `queue/{u}` means "u needs a machine". Entries are created by
//! submission and requeue, and removed by the scheduler only after the
//! assignment is written.

use dispatch_store::keys::child_name;
use dispatch_store::StoreResult;
use dispatch_unit::{Unit, UnitContext};
use tracing::info;

use crate::error::SupervisorResult;

#[derive(Clone)]
pub struct UnitQueue {
    ctx: UnitContext,
}

impl UnitQueue {
    pub fn new(ctx: UnitContext) -> Self {
        Self { ctx }
    }

    /// Declare a new unit: persist it, then queue it for placement.
    ///
    /// Global units are only persisted; propagation mirrors them onto
    /// every machine.
    pub async fn submit(&self, unit: &mut Unit) -> SupervisorResult<()> {
        unit.machine = None;
        unit.save(&self.ctx).await?;
        unit.put_on_queue(&self.ctx).await?;
        info!(unit = %unit.name, global = unit.global, "unit submitted");
        Ok(())
    }

    /// Queued unit names, oldest entry first.
    pub async fn pending(&self) -> StoreResult<Vec<String>> {
        let prefix = self.ctx.keys.queue();
        let mut entries = self.ctx.store.get_prefix(&prefix).await?;
        entries.sort_by_key(|kv| kv.create_revision);
        Ok(entries
            .iter()
            .filter_map(|kv| child_name(&prefix, &kv.key).map(str::to_string))
            .collect())
    }

    pub async fn contains(&self, name: &str) -> StoreResult<bool> {
        Ok(self
            .ctx
            .store
            .get(&self.ctx.keys.queue_entry(name))
            .await?
            .is_some())
    }

    /// Drop a queue entry. Returns `false` if there was none.
    pub async fn remove(&self, name: &str) -> StoreResult<bool> {
        Ok(self.ctx.store.delete(&self.ctx.keys.queue_entry(name)).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dispatch_store::{CoordinationStore, EmbeddedStore, Keyspace};
    use dispatch_unit::{RecordingSupervisor, UnitFiles};

    use super::*;

    fn queue(store: &EmbeddedStore, dir: &std::path::Path) -> UnitQueue {
        UnitQueue::new(UnitContext::new(
            Arc::new(store.clone()),
            Keyspace::new("z1"),
            Arc::new(RecordingSupervisor::new()),
            UnitFiles::new(dir),
            "m1",
        ))
    }

    #[tokio::test]
    async fn submit_queues_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::open_in_memory().unwrap();
        let queue = queue(&store, dir.path());

        let mut b = Unit::new("b").unwrap();
        let mut a = Unit::new("a").unwrap();
        queue.submit(&mut b).await.unwrap();
        queue.submit(&mut a).await.unwrap();

        assert_eq!(queue.pending().await.unwrap(), vec!["b.service", "a.service"]);
        assert!(queue.contains("a.service").await.unwrap());
        assert!(queue.remove("a.service").await.unwrap());
        assert!(!queue.remove("a.service").await.unwrap());
    }

    #[tokio::test]
    async fn global_units_are_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::open_in_memory().unwrap();
        let queue = queue(&store, dir.path());
        let keys = Keyspace::new("z1");

        let mut unit = Unit::new("agent").unwrap().as_global();
        queue.submit(&mut unit).await.unwrap();

        assert!(queue.pending().await.unwrap().is_empty());
        assert!(store.get(&keys.global("agent.service")).await.unwrap().is_some());
    }
}
