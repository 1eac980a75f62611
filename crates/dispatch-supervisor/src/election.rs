//! Leader election — one supervisor per zone.
//!
//! ```text
//!   Idle ──(supervisor/alive absent)──► Candidate
//!   Candidate ──(vote created and read back as ours)──► Leader
//!   Candidate ──(vote held by another machine)──► Idle
//!   Leader ──(lease lost)──► Idle, subsystems stopped, role loop restarts
//! ```
//!
//! The vote, `supervisor/alive` and `supervisor/machine` are bound to one
//! lease. Only the holder of an unexpired supervisor lease runs the
//! failure detector, global propagation and the scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_store::{
    LeaseId, SharedStore, StoreError, StoreResult, WatchControl, WatchEvent, WatchHandler,
    run_watch,
};
use dispatch_unit::UnitContext;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::detector::FailureDetector;
use crate::error::SupervisorResult;
use crate::globals::GlobalPropagator;
use crate::scheduler::Scheduler;

/// Election role of this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    Candidate,
    Leader,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub lease_ttl: Duration,
    pub keepalive_interval: Duration,
    pub schedule_interval: Duration,
    /// Period of the vacancy check backing the alive-key watch.
    pub vacancy_check_interval: Duration,
    /// Pause after a failed election attempt.
    pub retry_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(1),
            schedule_interval: Duration::from_secs(5),
            vacancy_check_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Runs the election and, while leading, the supervisor subsystems.
pub struct Supervisor {
    ctx: UnitContext,
    config: SupervisorConfig,
    role: watch::Sender<Role>,
    /// One election at a time.
    election: Mutex<()>,
}

impl Supervisor {
    pub fn new(ctx: UnitContext, config: SupervisorConfig) -> Self {
        let (role, _) = watch::channel(Role::Idle);
        Self {
            ctx,
            config,
            role,
            election: Mutex::new(()),
        }
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    /// Observe role changes.
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    fn set_role(&self, role: Role) {
        self.role.send_if_modified(|current| {
            if *current == role {
                return false;
            }
            debug!(from = ?current, to = ?role, "election role changed");
            *current = role;
            true
        });
    }

    /// Name of the current supervisor, if any.
    pub async fn current_leader(&self) -> StoreResult<Option<String>> {
        self.ctx.store.get_value(&self.ctx.keys.supervisor_machine()).await
    }

    /// Try once to become supervisor.
    ///
    /// Returns the supervisor lease on a win, `None` when a supervisor
    /// already exists or another candidate won the vote.
    pub async fn campaign(&self) -> SupervisorResult<Option<LeaseId>> {
        let _election = self.election.lock().await;
        let store = &self.ctx.store;
        let keys = &self.ctx.keys;
        let me = self.ctx.machine.as_str();

        if store.get(&keys.supervisor_alive()).await?.is_some() {
            self.set_role(Role::Idle);
            return Ok(None);
        }

        self.set_role(Role::Candidate);
        let lease = store.grant_lease(self.config.lease_ttl).await?;
        let won = match self.vote(lease).await {
            Ok(won) => won,
            Err(e) => {
                let _ = store.revoke_lease(lease).await;
                self.set_role(Role::Idle);
                return Err(e);
            }
        };
        if !won {
            let _ = store.revoke_lease(lease).await;
            self.set_role(Role::Idle);
            return Ok(None);
        }

        store.put(&keys.supervisor_machine(), me, Some(lease)).await?;
        self.set_role(Role::Leader);
        info!(machine = %me, lease, "elected supervisor");
        Ok(Some(lease))
    }

    /// Cast the vote and claim `supervisor/alive`. `true` if both are ours.
    async fn vote(&self, lease: LeaseId) -> SupervisorResult<bool> {
        let store = &self.ctx.store;
        let keys = &self.ctx.keys;
        let me = self.ctx.machine.as_str();

        store.put_if_absent(&keys.vote(), me, Some(lease)).await?;
        let holder = store.get(&keys.vote()).await?;
        let ours = holder
            .as_ref()
            .is_some_and(|kv| kv.value == me && kv.lease == Some(lease));
        if !ours {
            debug!(
                machine = %me,
                holder = holder.as_ref().map(|kv| kv.value.as_str()).unwrap_or(""),
                "election lost"
            );
            return Ok(false);
        }
        Ok(store.put_if_absent(&keys.supervisor_alive(), me, Some(lease)).await?)
    }

    /// Take part in elections until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(machine = %self.ctx.machine, "supervisor election started");
        while !*shutdown.borrow() {
            match self.campaign().await {
                Ok(Some(lease)) => self.lead(lease, &mut shutdown).await,
                Ok(None) => self.await_vacancy(&mut shutdown).await,
                Err(e) => {
                    warn!(error = %e, "election attempt failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        self.set_role(Role::Idle);
        info!(machine = %self.ctx.machine, "supervisor election stopped");
    }

    /// Run the supervisor subsystems while the lease holds.
    async fn lead(&self, lease: LeaseId, shutdown: &mut watch::Receiver<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(Arc::new(FailureDetector::new(self.ctx.clone())).run(stop_rx.clone())),
            tokio::spawn(Arc::new(GlobalPropagator::new(self.ctx.clone())).run(stop_rx.clone())),
            tokio::spawn(
                Arc::new(
                    Scheduler::new(self.ctx.clone()).with_interval(self.config.schedule_interval),
                )
                .run(stop_rx),
            ),
        ];

        let lost = loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.keepalive_interval) => {
                    match self.ctx.store.keep_alive(lease).await {
                        Ok(()) => {}
                        Err(StoreError::LeaseNotFound(_)) => break true,
                        Err(e) => warn!(lease, error = %e, "supervisor lease renewal failed"),
                    }
                }
                _ = shutdown.changed() => break false,
            }
        };

        let _ = stop_tx.send(true);
        for handle in handles {
            let _ = handle.await;
        }

        if lost {
            warn!(machine = %self.ctx.machine, lease, "supervisor lease lost, stepping down");
        } else {
            if let Err(e) = self.ctx.store.revoke_lease(lease).await {
                warn!(lease, error = %e, "supervisor lease revoke failed");
            }
            info!(machine = %self.ctx.machine, "supervisor resigned");
        }
        self.set_role(Role::Idle);
    }

    /// Wait until the supervisor slot looks free.
    async fn await_vacancy(&self, shutdown: &mut watch::Receiver<bool>) {
        let key = self.ctx.keys.supervisor_alive();
        let store = self.ctx.store.clone();
        let mut handler = VacancyWatch {
            store: store.clone(),
            alive: key.clone(),
            vote: self.ctx.keys.vote(),
        };
        let poll = async {
            let mut interval = tokio::time::interval(self.config.vacancy_check_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                match store.get(&key).await {
                    Ok(None) => break,
                    Ok(Some(_)) => {}
                    Err(e) => debug!(error = %e, "vacancy check failed"),
                }
            }
        };
        tokio::select! {
            _ = run_watch(store.as_ref(), &key, false, &mut handler, shutdown) => {}
            _ = poll => {}
        }
    }
}

/// Stops once `supervisor/alive` is gone.
///
/// A resync also waits out a vote that has no alive key yet, so a
/// candidate that lost does not immediately campaign again.
struct VacancyWatch {
    store: SharedStore,
    alive: String,
    vote: String,
}

#[async_trait]
impl WatchHandler for VacancyWatch {
    async fn resync(&mut self) -> StoreResult<WatchControl> {
        let alive = self.store.get(&self.alive).await?;
        let vote = self.store.get(&self.vote).await?;
        Ok(if alive.is_none() && vote.is_none() {
            WatchControl::Stop
        } else {
            WatchControl::Continue
        })
    }

    async fn on_event(&mut self, event: WatchEvent) -> WatchControl {
        if event.is_delete() {
            WatchControl::Stop
        } else {
            WatchControl::Continue
        }
    }
}
