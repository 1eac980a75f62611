//! Machine agent — per-host participation in the cluster.
//!
//! The agent runs on every machine. On start it sweeps unit files left
//! by a previous process, publishes its record and a lease-bound
//! liveness marker, then runs four loops until shutdown:
//!
//! - **keepalive**: renew the lease, re-register if it was lost
//! - **load**: publish the load average
//! - **assignments**: watch `machines/{me}/units/` and track/untrack units
//! - **check**: periodic sweep that re-derives the assigned set, the
//!   backstop against missed watch events

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_store::codec::encode_pairs;
use dispatch_store::keys::{self, child_name};
use dispatch_store::{
    LeaseId, StoreError, StoreResult, WatchControl, WatchEvent, WatchHandler, run_watch,
};
use dispatch_unit::UnitContext;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::MachineResult;
use crate::load::{LoadSource, SystemLoad};
use crate::tracker::UnitTracker;

/// Configuration for the machine agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Machine name, unique within the zone.
    pub name: String,
    pub arch: String,
    pub public_ip: Option<String>,
    /// Tags matched against unit constraints.
    pub tags: BTreeMap<String, String>,
    /// TTL of the liveness lease.
    pub lease_ttl: Duration,
    /// Renewal period, well under the TTL.
    pub keepalive_interval: Duration,
    pub load_interval: Duration,
    /// Period of the reconciliation sweep.
    pub check_interval: Duration,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arch: std::env::consts::ARCH.to_string(),
            public_ip: None,
            tags: BTreeMap::new(),
            lease_ttl: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(1),
            load_interval: Duration::from_secs(1),
            check_interval: Duration::from_secs(10),
        }
    }
}

/// The agent that keeps this machine alive in the store and runs its units.
pub struct MachineAgent {
    ctx: UnitContext,
    config: AgentConfig,
    tracker: UnitTracker,
    load_source: Arc<dyn LoadSource>,
    lease: Mutex<Option<LeaseId>>,
}

impl MachineAgent {
    pub fn new(ctx: UnitContext, config: AgentConfig) -> Self {
        let tracker = UnitTracker::new(ctx.clone());
        Self {
            ctx,
            config,
            tracker,
            load_source: Arc::new(SystemLoad),
            lease: Mutex::new(None),
        }
    }

    /// Replace the load sampler.
    pub fn with_load_source(mut self, source: Arc<dyn LoadSource>) -> Self {
        self.load_source = source;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn tracker(&self) -> &UnitTracker {
        &self.tracker
    }

    /// Current liveness lease, if registered.
    pub async fn lease(&self) -> Option<LeaseId> {
        *self.lease.lock().await
    }

    /// Kill and remove every unit file left by a previous process.
    ///
    /// Nothing is assigned to this process yet, so anything on disk is
    /// stale. Returns the number of units removed.
    pub async fn kill_all_old_units(&self) -> MachineResult<usize> {
        let names = self.ctx.files.list().await?;
        for name in &names {
            if let Err(e) = self.ctx.supervisor.kill(name, libc::SIGKILL).await {
                debug!(unit = %name, error = %e, "kill of stale unit failed");
            }
            self.ctx.files.remove(name).await?;
        }
        if !names.is_empty() {
            self.ctx.supervisor.reload().await.map_err(dispatch_unit::UnitError::from)?;
            info!(count = names.len(), "removed stale units from previous run");
        }
        Ok(names.len())
    }

    /// Publish the machine record and a fresh liveness marker.
    pub async fn register(&self) -> MachineResult<LeaseId> {
        let store = &self.ctx.store;
        let name = &self.config.name;

        // The leased marker goes first: a supervisor scan must never see
        // this machine's fields without it and reap them as a dead machine.
        let lease = store.grant_lease(self.config.lease_ttl).await?;
        store
            .put(&self.ctx.keys.machine_alive(name), name, Some(lease))
            .await?;

        // The marker is bound to the new lease before the old one goes away.
        let previous = self.lease.lock().await.replace(lease);
        if let Some(old) = previous.filter(|old| *old != lease) {
            if let Err(e) = store.revoke_lease(old).await {
                debug!(lease = old, error = %e, "revoking previous lease failed");
            }
        }

        self.publish_record().await?;
        info!(machine = %name, lease, "machine registered");
        Ok(lease)
    }

    /// Write `arch`, `ip` and `tags`.
    pub async fn publish_record(&self) -> MachineResult<()> {
        let store = &self.ctx.store;
        let keys = &self.ctx.keys;
        let name = &self.config.name;

        store
            .put(&keys.machine_field(name, keys::MACHINE_ARCH), &self.config.arch, None)
            .await?;
        if let Some(ip) = &self.config.public_ip {
            store
                .put(&keys.machine_field(name, keys::MACHINE_IP), ip, None)
                .await?;
        }
        if !self.config.tags.is_empty() {
            store
                .put(
                    &keys.machine_field(name, keys::MACHINE_TAGS),
                    &encode_pairs(&self.config.tags),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// Revoke the liveness lease. The supervisor treats this machine as gone.
    pub async fn deregister(&self) {
        if let Some(lease) = self.lease.lock().await.take() {
            match self.ctx.store.revoke_lease(lease).await {
                Ok(()) => info!(machine = %self.config.name, "machine deregistered"),
                Err(e) => warn!(machine = %self.config.name, error = %e, "lease revoke failed"),
            }
        }
    }

    /// Names of units assigned to this machine.
    pub async fn assigned_units(&self) -> StoreResult<BTreeSet<String>> {
        let prefix = self.ctx.keys.machine_units(&self.config.name);
        Ok(self
            .ctx
            .store
            .get_prefix(&prefix)
            .await?
            .iter()
            .filter_map(|kv| child_name(&prefix, &kv.key).map(str::to_string))
            .collect())
    }

    pub async fn publish_load(&self) -> MachineResult<f64> {
        let load = self.load_source.sample().await?;
        self.ctx
            .store
            .put(
                &self.ctx.keys.machine_field(&self.config.name, keys::MACHINE_LOAD),
                &format!("{load:.2}"),
                None,
            )
            .await?;
        Ok(load)
    }

    /// Run the agent until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> MachineResult<()> {
        self.kill_all_old_units().await?;
        self.register().await?;
        if let Err(e) = self.publish_load().await {
            warn!(error = %e, "initial load publication failed");
        }

        let handles = vec![
            tokio::spawn(self.clone().run_keepalive(shutdown.clone())),
            tokio::spawn(self.clone().run_load(shutdown.clone())),
            tokio::spawn(self.clone().run_assignments(shutdown.clone())),
            tokio::spawn(self.clone().run_check(shutdown.clone())),
        ];
        info!(machine = %self.config.name, "machine agent started");

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
        self.tracker.shutdown().await;
        self.deregister().await;
        info!(machine = %self.config.name, "machine agent stopped");
        Ok(())
    }

    async fn run_keepalive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.keepalive_interval) => {
                    let current = self.lease().await;
                    let result = match current {
                        Some(lease) => self.ctx.store.keep_alive(lease).await,
                        None => Err(StoreError::Request("no lease held".into())),
                    };
                    match result {
                        Ok(()) => failures = 0,
                        Err(StoreError::LeaseNotFound(lease)) => {
                            warn!(machine = %self.config.name, lease, "machine lease lost, re-registering");
                            if let Err(e) = self.register().await {
                                warn!(error = %e, "re-registration failed");
                            }
                        }
                        Err(e) if current.is_none() => {
                            debug!(error = %e, "registering");
                            if let Err(e) = self.register().await {
                                warn!(error = %e, "registration failed");
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(machine = %self.config.name, failures, error = %e, "lease renewal failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_load(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.load_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.publish_load().await {
                        debug!(error = %e, "load publication failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_assignments(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let prefix = self.ctx.keys.machine_units(&self.config.name);
        let store = self.ctx.store.clone();
        let mut handler = AssignmentWatch {
            agent: self.clone(),
            prefix: prefix.clone(),
        };
        run_watch(store.as_ref(), &prefix, true, &mut handler, &mut shutdown).await;
    }

    async fn run_check(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        // The first tick fires immediately; the watch resync covers startup.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.check().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One reconciliation sweep.
    pub async fn check(&self) {
        let alive_key = self.ctx.keys.machine_alive(&self.config.name);
        match self.ctx.store.get(&alive_key).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(machine = %self.config.name, "liveness marker missing, re-registering");
                if let Err(e) = self.register().await {
                    warn!(error = %e, "re-registration failed");
                }
            }
            Err(e) => warn!(error = %e, "liveness check failed"),
        }

        // A reap racing the marker can leave it alive with no record.
        let arch_key = self.ctx.keys.machine_field(&self.config.name, keys::MACHINE_ARCH);
        match self.ctx.store.get(&arch_key).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(machine = %self.config.name, "machine record missing, republishing");
                if let Err(e) = self.publish_record().await {
                    warn!(error = %e, "record republication failed");
                }
            }
            Err(e) => warn!(error = %e, "record check failed"),
        }

        match self.assigned_units().await {
            Ok(assigned) => self.tracker.sync(&assigned).await,
            Err(e) => warn!(error = %e, "failed to read assigned units"),
        }
    }
}

/// Follows `machines/{me}/units/`.
struct AssignmentWatch {
    agent: Arc<MachineAgent>,
    prefix: String,
}

#[async_trait]
impl WatchHandler for AssignmentWatch {
    async fn resync(&mut self) -> StoreResult<WatchControl> {
        let assigned = self.agent.assigned_units().await?;
        debug!(count = assigned.len(), "resyncing assigned units");
        self.agent.tracker.sync(&assigned).await;
        Ok(WatchControl::Continue)
    }

    async fn on_event(&mut self, event: WatchEvent) -> WatchControl {
        let Some(name) = child_name(&self.prefix, event.key()) else {
            return WatchControl::Continue;
        };
        if event.is_delete() {
            self.agent.tracker.untrack(name).await;
        } else if let Err(e) = self.agent.tracker.track(name).await {
            warn!(unit = %name, error = %e, "failed to track assigned unit");
        }
        WatchControl::Continue
    }
}
