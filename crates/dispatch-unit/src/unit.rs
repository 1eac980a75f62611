//! Unit model and desired-state reconciliation.
//!
//! A [`Unit`] is one workload. Its record lives under `units/{name}/`;
//! the machine holding the assignment materializes it (writes the unit
//! file, links it into the process supervisor) and then converges the
//! observed `state` toward `desiredState`:
//!
//! ```text
//!   desired Active  ──► start ──► state Starting ──► Active | Dead
//!   desired Dead    ──► stop (kill -9 on failure) ──► state Dead
//!   desired Destroy ──► stop, remove file, delete every key
//! ```
//!
//! Every operation is idempotent. Create and destroy of the same unit on
//! one machine serialize on a per-unit lock since both touch the same
//! file and supervisor unit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dispatch_store::codec::{decode_pairs, decode_ports, encode_pairs, encode_ports};
use dispatch_store::keys::{self, Keyspace, child_name, last_segment};
use dispatch_store::{
    SharedStore, StoreCache, StoreResult, WatchControl, WatchEvent, WatchHandler, run_watch,
};
use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{debug, info, warn};

use crate::error::{UnitError, UnitResult};
use crate::files::UnitFiles;
use crate::process::{JobResult, ProcessSupervisor};
use crate::state::UnitState;

/// Suffixes the process supervisor recognizes as unit types.
const UNIT_SUFFIXES: &[&str] = &[
    ".service", ".socket", ".timer", ".target", ".mount", ".path",
];

const WAIT_RESUBSCRIBE: Duration = Duration::from_millis(100);

/// Canonical unit name: `.service` is appended unless a unit-type suffix
/// is already present.
pub fn normalize_name(name: &str) -> UnitResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(UnitError::EmptyName);
    }
    if UNIT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}.service"))
    }
}

// ── Context ────────────────────────────────────────────────────

/// Handles shared by every unit operation on this machine.
#[derive(Clone)]
pub struct UnitContext {
    pub store: SharedStore,
    pub keys: Keyspace,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub files: UnitFiles,
    /// Name of the local machine.
    pub machine: String,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl UnitContext {
    pub fn new(
        store: SharedStore,
        keys: Keyspace,
        supervisor: Arc<dyn ProcessSupervisor>,
        files: UnitFiles,
        machine: impl Into<String>,
    ) -> Self {
        Self {
            store,
            keys,
            supervisor,
            files,
            machine: machine.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serialize local file/supervisor mutations of one unit.
    pub async fn lock_unit(&self, unit: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(unit.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the unit's lock entry unless someone holds or waits on it.
    fn release_unit(&self, unit: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(unit)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(unit);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

// ── Unit ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Unit {
    pub name: String,
    /// Assigned machine, `None` while queued.
    pub machine: Option<String>,
    /// Template this unit was instantiated from.
    pub template: Option<String>,
    /// Global units run on every machine and bypass the scheduler.
    pub global: bool,
    /// Observed state, written by the assigned machine.
    pub state: UnitState,
    pub desired_state: UnitState,
    pub ports: BTreeSet<u16>,
    /// Machine tags required for placement.
    pub constraints: BTreeMap<String, String>,
    /// Unit file body.
    pub content: String,
    /// The record was loaded from or saved to the store.
    pub on_store: bool,
    /// The unit file is materialized on this machine.
    pub on_disk: bool,
}

fn non_empty(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

impl Unit {
    /// A new unsaved unit whose desired state is `Active`.
    pub fn new(name: &str) -> UnitResult<Self> {
        Ok(Self {
            name: normalize_name(name)?,
            desired_state: UnitState::Active,
            ..Self::default()
        })
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    pub fn with_constraint(mut self, key: &str, value: &str) -> Self {
        self.constraints.insert(key.to_string(), value.to_string());
        self
    }

    pub fn as_global(mut self) -> Self {
        self.global = true;
        self
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    // ── Loading ────────────────────────────────────────────────

    /// Build a unit from `(key, value)` pairs of its record.
    ///
    /// Returns `None` when there are no keys at all, and
    /// [`UnitError::Corrupt`] when keys exist but the `name` field is
    /// missing or disagrees with the key.
    fn from_fields(
        name: &str,
        fields: impl IntoIterator<Item = (String, String)>,
    ) -> UnitResult<Option<Self>> {
        let mut unit = Self::default();
        let mut seen = false;
        for (key, value) in fields {
            seen = true;
            match last_segment(&key) {
                keys::UNIT_NAME => unit.name = value,
                keys::UNIT_MACHINE => unit.machine = non_empty(value),
                keys::UNIT_TEMPLATE => unit.template = non_empty(value),
                keys::UNIT_GLOBAL => unit.global = !value.trim().is_empty(),
                keys::UNIT_DESIRED_STATE => unit.desired_state = UnitState::parse(&value),
                keys::UNIT_STATE => unit.state = UnitState::parse(&value),
                keys::UNIT_PORTS => unit.ports = decode_ports(&value),
                keys::UNIT_CONSTRAINTS => unit.constraints = decode_pairs(&value),
                keys::UNIT_CONTENT => unit.content = value,
                other => debug!(unit = name, field = other, "ignoring unknown unit field"),
            }
        }
        if !seen {
            return Ok(None);
        }
        if unit.name.is_empty() {
            return Err(UnitError::Corrupt(name.to_string(), "missing name".into()));
        }
        if unit.name != name {
            return Err(UnitError::Corrupt(
                name.to_string(),
                format!("name field is {}", unit.name),
            ));
        }
        unit.on_store = true;
        Ok(Some(unit))
    }

    /// Load a unit record with one prefix read.
    pub async fn load(ctx: &UnitContext, name: &str) -> UnitResult<Option<Self>> {
        let kvs = ctx.store.get_prefix(&ctx.keys.unit(name)).await?;
        Self::from_fields(name, kvs.into_iter().map(|kv| (kv.key, kv.value)))
    }

    /// Load a unit record through a read-through cache.
    pub async fn load_cached(
        ctx: &UnitContext,
        cache: &mut StoreCache,
        name: &str,
    ) -> UnitResult<Option<Self>> {
        let fields = cache.get_all(&ctx.keys.unit(name)).await?;
        Self::from_fields(name, fields)
    }

    /// Every readable unit in the zone. Corrupt records are skipped.
    pub async fn list_all(ctx: &UnitContext) -> UnitResult<Vec<Self>> {
        let prefix = ctx.keys.units();
        let mut grouped: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for kv in ctx.store.get_prefix(&prefix).await? {
            if let Some(name) = child_name(&prefix, &kv.key) {
                grouped
                    .entry(name.to_string())
                    .or_default()
                    .push((kv.key, kv.value));
            }
        }

        let mut units = Vec::with_capacity(grouped.len());
        for (name, fields) in grouped {
            match Self::from_fields(&name, fields) {
                Ok(Some(unit)) => units.push(unit),
                Ok(None) => {}
                Err(e) => warn!(unit = %name, error = %e, "skipping unreadable unit"),
            }
        }
        Ok(units)
    }

    /// Whether the unit's `name` key exists.
    pub async fn exists(ctx: &UnitContext, name: &str) -> UnitResult<bool> {
        Ok(ctx
            .store
            .get(&ctx.keys.unit_field(name, keys::UNIT_NAME))
            .await?
            .is_some())
    }

    // ── Persistence ────────────────────────────────────────────

    /// Write the unit record. The `name` key goes last so a reader never
    /// sees a named unit with missing fields.
    pub async fn save(&mut self, ctx: &UnitContext) -> UnitResult<()> {
        if self.name.is_empty() {
            return Err(UnitError::EmptyName);
        }

        let mut fields = vec![
            (keys::UNIT_CONTENT, self.content.clone()),
            (keys::UNIT_DESIRED_STATE, self.desired_state.to_string()),
            (keys::UNIT_PORTS, encode_ports(&self.ports)),
        ];
        if !self.constraints.is_empty() {
            fields.push((keys::UNIT_CONSTRAINTS, encode_pairs(&self.constraints)));
        }
        if let Some(template) = &self.template {
            fields.push((keys::UNIT_TEMPLATE, template.clone()));
        }
        if let Some(machine) = &self.machine {
            fields.push((keys::UNIT_MACHINE, machine.clone()));
        }
        if self.global {
            fields.push((keys::UNIT_GLOBAL, "true".to_string()));
        }
        fields.push((keys::UNIT_NAME, self.name.clone()));

        for (field, value) in fields {
            ctx.store
                .put(&ctx.keys.unit_field(&self.name, field), &value, None)
                .await?;
        }
        if self.global {
            ctx.store
                .put(&ctx.keys.global(&self.name), &self.name, None)
                .await?;
        }

        self.on_store = true;
        debug!(unit = %self.name, global = self.global, "unit saved");
        Ok(())
    }

    /// Request placement: clear the assignment, then enqueue.
    ///
    /// Global units are mirrored onto machines directly and never queued.
    pub async fn put_on_queue(&mut self, ctx: &UnitContext) -> UnitResult<()> {
        if self.global {
            debug!(unit = %self.name, "global unit is not queued");
            return Ok(());
        }
        ctx.store
            .delete(&ctx.keys.unit_field(&self.name, keys::UNIT_MACHINE))
            .await?;
        ctx.store
            .put(&ctx.keys.queue_entry(&self.name), &self.name, None)
            .await?;
        self.machine = None;
        info!(unit = %self.name, "unit queued for placement");
        Ok(())
    }

    pub async fn set_desired_state(
        &mut self,
        ctx: &UnitContext,
        state: UnitState,
    ) -> UnitResult<()> {
        ctx.store
            .put(
                &ctx.keys.unit_field(&self.name, keys::UNIT_DESIRED_STATE),
                state.as_str(),
                None,
            )
            .await?;
        self.desired_state = state;
        Ok(())
    }

    /// Record the observed state.
    ///
    /// Skipped for global units and for units this machine does not own.
    pub async fn set_state(&mut self, ctx: &UnitContext, state: UnitState) -> UnitResult<()> {
        if self.global {
            self.state = state;
            return Ok(());
        }
        if self.machine.as_deref() != Some(ctx.machine.as_str()) {
            debug!(unit = %self.name, %state, "not the assigned machine, state not recorded");
            return Ok(());
        }
        ctx.store
            .put(
                &ctx.keys.unit_field(&self.name, keys::UNIT_STATE),
                state.as_str(),
                None,
            )
            .await?;
        self.state = state;
        Ok(())
    }

    // ── Local lifecycle ────────────────────────────────────────

    /// Materialize the unit on this machine: write the file, stop any
    /// previous instance, link it into the supervisor and reload.
    pub async fn create(&mut self, ctx: &UnitContext) -> UnitResult<()> {
        if self.name.is_empty() {
            return Err(UnitError::EmptyName);
        }
        let _guard = ctx.lock_unit(&self.name).await;

        let path = ctx.files.write(&self.name, &self.content).await?;
        if let Err(e) = ctx.supervisor.stop(&self.name).await {
            debug!(unit = %self.name, error = %e, "stop before create failed");
        }
        ctx.supervisor.link_unit_files(&[path]).await?;
        ctx.supervisor.reload().await?;

        self.on_disk = true;
        info!(unit = %self.name, "unit materialized");
        Ok(())
    }

    /// Start the unit and record `Active` or `Dead`.
    pub async fn start(&mut self, ctx: &UnitContext) -> UnitResult<UnitState> {
        self.set_state(ctx, UnitState::Starting).await?;
        let observed = match ctx.supervisor.start(&self.name).await {
            Ok(JobResult::Done) => UnitState::Active,
            Ok(JobResult::Failed) => {
                warn!(unit = %self.name, "unit failed to start");
                UnitState::Dead
            }
            Err(e) => {
                warn!(unit = %self.name, error = %e, "start request failed");
                UnitState::Dead
            }
        };
        self.set_state(ctx, observed).await?;
        info!(unit = %self.name, state = %observed, "unit start finished");
        Ok(observed)
    }

    /// Stop the unit, killing it if the stop fails, and record `Dead`.
    pub async fn stop(&mut self, ctx: &UnitContext) -> UnitResult<()> {
        stop_process(ctx, &self.name).await;
        self.set_state(ctx, UnitState::Dead).await?;
        info!(unit = %self.name, "unit stopped");
        Ok(())
    }

    pub async fn restart(&mut self, ctx: &UnitContext) -> UnitResult<UnitState> {
        self.stop(ctx).await?;
        self.start(ctx).await
    }

    /// Stop the unit and remove its file without touching the store.
    pub async fn teardown(ctx: &UnitContext, name: &str) {
        let guard = ctx.lock_unit(name).await;
        if ctx.files.exists(name).await {
            teardown_locked(ctx, name).await;
        }
        drop(guard);
        ctx.release_unit(name);
    }

    /// Tear the unit down and delete every key that refers to it.
    ///
    /// Destroying an already destroyed unit is a no-op apart from
    /// clearing the local flags.
    pub async fn destroy(&mut self, ctx: &UnitContext) -> UnitResult<()> {
        let guard = ctx.lock_unit(&self.name).await;
        if self.on_disk || ctx.files.exists(&self.name).await {
            teardown_locked(ctx, &self.name).await;
        }
        self.on_disk = false;

        let purged = match ctx.store.get(&ctx.keys.global(&self.name)).await {
            Ok(declared) => {
                let global = self.global || declared.is_some();
                Self::purge(ctx, &self.name, global).await
            }
            Err(e) => Err(e.into()),
        };
        drop(guard);
        ctx.release_unit(&self.name);
        purged?;
        self.on_store = false;
        self.machine = None;
        info!(unit = %self.name, "unit destroyed");
        Ok(())
    }

    /// Delete all persisted state of a unit: its record, queue entry,
    /// global declaration and every machine membership.
    ///
    /// The local machine's membership goes last: deleting it ends this
    /// machine's tracking of the unit.
    pub async fn purge(ctx: &UnitContext, name: &str, global: bool) -> UnitResult<()> {
        ctx.store.delete_prefix(&ctx.keys.unit(name)).await?;
        ctx.store.delete(&ctx.keys.queue_entry(name)).await?;
        if global {
            ctx.store.delete(&ctx.keys.global(name)).await?;
        }

        let suffix = format!("/{}/{name}", keys::MACHINE_UNITS);
        let local = ctx.keys.machine_unit(&ctx.machine, name);
        let mut memberships: Vec<String> = ctx
            .store
            .get_prefix(&ctx.keys.machines())
            .await?
            .into_iter()
            .map(|kv| kv.key)
            .filter(|key| key.ends_with(&suffix))
            .collect();
        memberships.sort_by_key(|key| *key == local);
        for key in memberships {
            ctx.store.delete(&key).await?;
        }
        Ok(())
    }

    /// Act on the desired state.
    pub async fn become_desired_state(&mut self, ctx: &UnitContext) -> UnitResult<()> {
        if self.desired_state == UnitState::Destroy {
            return self.destroy(ctx).await;
        }

        // A stale Active/Dead can arrive after the record was deleted;
        // never rebuild a unit that no longer exists.
        if !Self::exists(ctx, &self.name).await? {
            debug!(unit = %self.name, "unit no longer exists, tearing down");
            Self::teardown(ctx, &self.name).await;
            self.on_disk = false;
            self.on_store = false;
            return Ok(());
        }

        if !self.on_disk {
            self.create(ctx).await?;
        }
        match self.desired_state {
            UnitState::Dead => self.stop(ctx).await,
            _ => self.start(ctx).await.map(|_| ()),
        }
    }

    // ── Waiters ────────────────────────────────────────────────

    /// Wait until the unit's `name` key is gone. Returns `false` on timeout.
    pub async fn wait_on_destroy(
        ctx: &UnitContext,
        name: &str,
        timeout: Duration,
    ) -> UnitResult<bool> {
        let key = ctx.keys.unit_field(name, keys::UNIT_NAME);
        match tokio::time::timeout(timeout, wait_for_absence(&ctx.store, &key)).await {
            Ok(result) => result,
            Err(_) => Ok(false),
        }
    }

    /// Wait until the unit's observed state is `target`. Returns `false`
    /// on timeout.
    pub async fn wait_on_state(
        ctx: &UnitContext,
        name: &str,
        target: UnitState,
        timeout: Duration,
    ) -> UnitResult<bool> {
        let key = ctx.keys.unit_field(name, keys::UNIT_STATE);
        match tokio::time::timeout(timeout, wait_for_state(&ctx.store, &key, target)).await {
            Ok(result) => result,
            Err(_) => Ok(false),
        }
    }

    // ── Supervision ────────────────────────────────────────────

    /// Drive the unit toward its desired state, following changes of
    /// `desiredState`, until it is destroyed or `shutdown` fires.
    pub async fn supervise(self, ctx: UnitContext, mut shutdown: watch::Receiver<bool>) {
        let key = ctx.keys.unit_field(&self.name, keys::UNIT_DESIRED_STATE);
        let store = ctx.store.clone();
        let mut handler = DesiredStateWatch {
            unit: self,
            ctx,
            applied: None,
        };
        run_watch(store.as_ref(), &key, false, &mut handler, &mut shutdown).await;
        debug!(unit = %handler.unit.name, "unit supervision ended");
    }
}

async fn stop_process(ctx: &UnitContext, name: &str) {
    let failure = match ctx.supervisor.stop(name).await {
        Ok(JobResult::Done) => return,
        Ok(JobResult::Failed) => "stop job failed".to_string(),
        Err(e) => e.to_string(),
    };
    warn!(unit = %name, reason = %failure, "stop failed, killing unit");
    if let Err(e) = ctx.supervisor.kill(name, libc::SIGKILL).await {
        warn!(unit = %name, error = %e, "kill failed");
    }
}

async fn teardown_locked(ctx: &UnitContext, name: &str) {
    stop_process(ctx, name).await;
    if let Err(e) = ctx.files.remove(name).await {
        warn!(unit = %name, error = %e, "failed to remove unit file");
    }
    if let Err(e) = ctx.supervisor.reload().await {
        warn!(unit = %name, error = %e, "reload after teardown failed");
    }
    debug!(unit = %name, "unit torn down locally");
}

async fn wait_for_absence(store: &SharedStore, key: &str) -> UnitResult<bool> {
    loop {
        let mut stream = store.watch(key, false).await?;
        if store.get(key).await?.is_none() {
            return Ok(true);
        }
        while let Some(event) = stream.next().await {
            if event.is_delete() {
                return Ok(true);
            }
        }
        tokio::time::sleep(WAIT_RESUBSCRIBE).await;
    }
}

async fn wait_for_state(store: &SharedStore, key: &str, target: UnitState) -> UnitResult<bool> {
    loop {
        let mut stream = store.watch(key, false).await?;
        if let Some(value) = store.get_value(key).await? {
            if UnitState::parse(&value) == target {
                return Ok(true);
            }
        }
        while let Some(event) = stream.next().await {
            if !event.is_delete() && UnitState::parse(event.value()) == target {
                return Ok(true);
            }
        }
        tokio::time::sleep(WAIT_RESUBSCRIBE).await;
    }
}

/// Follows one unit's `desiredState` key.
struct DesiredStateWatch {
    unit: Unit,
    ctx: UnitContext,
    /// Last desired state successfully acted on.
    applied: Option<UnitState>,
}

impl DesiredStateWatch {
    async fn converge(&mut self, desired: UnitState) -> WatchControl {
        if self.applied == Some(desired) {
            return WatchControl::Continue;
        }
        self.unit.desired_state = desired;
        if let Err(e) = self.unit.become_desired_state(&self.ctx).await {
            warn!(
                unit = %self.unit.name,
                %desired,
                error = %e,
                "failed to converge unit, will retry"
            );
            return WatchControl::Retry;
        }
        self.applied = Some(desired);
        if desired == UnitState::Destroy || !self.unit.on_store {
            WatchControl::Stop
        } else {
            WatchControl::Continue
        }
    }

    async fn vanished(&mut self) {
        info!(unit = %self.unit.name, "unit record removed, tearing down");
        Unit::teardown(&self.ctx, &self.unit.name).await;
        self.unit.on_disk = false;
        self.unit.on_store = false;
    }
}

#[async_trait]
impl WatchHandler for DesiredStateWatch {
    async fn resync(&mut self) -> StoreResult<WatchControl> {
        let key = self
            .ctx
            .keys
            .unit_field(&self.unit.name, keys::UNIT_DESIRED_STATE);
        match self.ctx.store.get_value(&key).await? {
            Some(raw) => Ok(self.converge(UnitState::parse(&raw)).await),
            None => {
                self.vanished().await;
                Ok(WatchControl::Stop)
            }
        }
    }

    async fn on_event(&mut self, event: WatchEvent) -> WatchControl {
        if event.is_delete() {
            self.vanished().await;
            return WatchControl::Stop;
        }
        self.converge(UnitState::parse(event.value())).await
    }
}
