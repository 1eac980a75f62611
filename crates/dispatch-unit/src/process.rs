//! Local process supervisor contract and adapters.
//!
//! The core needs five operations from the host's process manager:
//! start, stop, kill, link unit files and reload. [`SystemdSupervisor`]
//! drives systemd through `systemctl`; [`RecordingSupervisor`] is an
//! in-memory double that records every call.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Completion signal of a start or stop job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Done,
    Failed,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process supervisor unavailable: {0}")]
    Unavailable(String),

    #[error("{command} failed for {target}: {detail}")]
    Command {
        command: &'static str,
        target: String,
        detail: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start a unit and wait for the job to complete.
    async fn start(&self, unit: &str) -> Result<JobResult, ProcessError>;

    /// Stop a unit and wait for the job to complete.
    async fn stop(&self, unit: &str) -> Result<JobResult, ProcessError>;

    /// Send `signal` to every process of the unit.
    async fn kill(&self, unit: &str, signal: i32) -> Result<(), ProcessError>;

    /// Make unit files known to the supervisor.
    async fn link_unit_files(&self, paths: &[PathBuf]) -> Result<(), ProcessError>;

    /// Re-read unit definitions.
    async fn reload(&self) -> Result<(), ProcessError>;
}

// ── systemd ────────────────────────────────────────────────────

/// Adapter for systemd via `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    systemctl: PathBuf,
}

impl SystemdSupervisor {
    /// Verify `systemctl` is usable.
    ///
    /// Failing here is fatal for an agent: without a process supervisor
    /// there is nothing it can run.
    pub async fn connect() -> Result<Self, ProcessError> {
        Self::connect_with(Path::new("systemctl")).await
    }

    pub async fn connect_with(systemctl: &Path) -> Result<Self, ProcessError> {
        let output = Command::new(systemctl)
            .arg("--version")
            .output()
            .await
            .map_err(|e| ProcessError::Unavailable(e.to_string()))?;
        if !output.status.success() {
            return Err(ProcessError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let version = String::from_utf8_lossy(&output.stdout);
        info!(
            version = version.lines().next().unwrap_or_default(),
            "connected to systemd"
        );
        Ok(Self {
            systemctl: systemctl.to_path_buf(),
        })
    }

    async fn job(&self, verb: &'static str, unit: &str) -> Result<JobResult, ProcessError> {
        let output = Command::new(&self.systemctl)
            .args([verb, unit])
            .output()
            .await?;
        if output.status.success() {
            debug!(%unit, verb, "systemd job done");
            Ok(JobResult::Done)
        } else {
            debug!(
                %unit,
                verb,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "systemd job failed"
            );
            Ok(JobResult::Failed)
        }
    }

    async fn run(&self, command: &'static str, args: &[String]) -> Result<(), ProcessError> {
        let output = Command::new(&self.systemctl).args(args).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProcessError::Command {
                command,
                target: args.last().cloned().unwrap_or_default(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ProcessSupervisor for SystemdSupervisor {
    async fn start(&self, unit: &str) -> Result<JobResult, ProcessError> {
        self.job("start", unit).await
    }

    async fn stop(&self, unit: &str) -> Result<JobResult, ProcessError> {
        self.job("stop", unit).await
    }

    async fn kill(&self, unit: &str, signal: i32) -> Result<(), ProcessError> {
        let args = vec![
            "kill".to_string(),
            format!("--signal={signal}"),
            unit.to_string(),
        ];
        self.run("kill", &args).await
    }

    async fn link_unit_files(&self, paths: &[PathBuf]) -> Result<(), ProcessError> {
        let mut args = vec![
            "link".to_string(),
            "--runtime".to_string(),
            "--force".to_string(),
        ];
        args.extend(paths.iter().map(|p| p.display().to_string()));
        self.run("link", &args).await
    }

    async fn reload(&self) -> Result<(), ProcessError> {
        self.run("daemon-reload", &["daemon-reload".to_string()]).await
    }
}

// ── Test double ────────────────────────────────────────────────

/// One call received by a [`RecordingSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
    Start(String),
    Stop(String),
    Kill(String, i32),
    Link(Vec<PathBuf>),
    Reload,
}

#[derive(Default)]
struct Recorded {
    calls: Vec<SupervisorCall>,
    running: HashSet<String>,
    failing_start: HashSet<String>,
    failing_stop: HashSet<String>,
}

/// In-memory process supervisor that records calls and tracks which
/// units are running. Start and stop can be made to fail per unit.
#[derive(Default)]
pub struct RecordingSupervisor {
    inner: Mutex<Recorded>,
    /// Latency added before every call.
    delay: Duration,
}

impl RecordingSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call take at least `delay`, like a real job would.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Recorded) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Make every future start of `unit` report failure.
    pub fn fail_start(&self, unit: &str) {
        self.with(|r| r.failing_start.insert(unit.to_string()));
    }

    /// Make every future stop of `unit` report failure.
    pub fn fail_stop(&self, unit: &str) {
        self.with(|r| r.failing_stop.insert(unit.to_string()));
    }

    pub fn calls(&self) -> Vec<SupervisorCall> {
        self.with(|r| r.calls.clone())
    }

    pub fn is_running(&self, unit: &str) -> bool {
        self.with(|r| r.running.contains(unit))
    }

    pub fn running(&self) -> Vec<String> {
        let mut units: Vec<String> = self.with(|r| r.running.iter().cloned().collect());
        units.sort();
        units
    }
}

#[async_trait]
impl ProcessSupervisor for RecordingSupervisor {
    async fn start(&self, unit: &str) -> Result<JobResult, ProcessError> {
        self.pause().await;
        Ok(self.with(|r| {
            r.calls.push(SupervisorCall::Start(unit.to_string()));
            if r.failing_start.contains(unit) {
                JobResult::Failed
            } else {
                r.running.insert(unit.to_string());
                JobResult::Done
            }
        }))
    }

    async fn stop(&self, unit: &str) -> Result<JobResult, ProcessError> {
        self.pause().await;
        Ok(self.with(|r| {
            r.calls.push(SupervisorCall::Stop(unit.to_string()));
            if r.failing_stop.contains(unit) {
                JobResult::Failed
            } else {
                r.running.remove(unit);
                JobResult::Done
            }
        }))
    }

    async fn kill(&self, unit: &str, signal: i32) -> Result<(), ProcessError> {
        self.pause().await;
        self.with(|r| {
            r.calls.push(SupervisorCall::Kill(unit.to_string(), signal));
            r.running.remove(unit);
        });
        Ok(())
    }

    async fn link_unit_files(&self, paths: &[PathBuf]) -> Result<(), ProcessError> {
        self.pause().await;
        self.with(|r| r.calls.push(SupervisorCall::Link(paths.to_vec())));
        Ok(())
    }

    async fn reload(&self) -> Result<(), ProcessError> {
        self.pause().await;
        self.with(|r| r.calls.push(SupervisorCall::Reload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_supervisor_tracks_running_units() {
        let supervisor = RecordingSupervisor::new();
        assert_eq!(supervisor.start("a.service").await.unwrap(), JobResult::Done);
        assert!(supervisor.is_running("a.service"));

        assert_eq!(supervisor.stop("a.service").await.unwrap(), JobResult::Done);
        assert!(!supervisor.is_running("a.service"));
        assert_eq!(
            supervisor.calls(),
            vec![
                SupervisorCall::Start("a.service".into()),
                SupervisorCall::Stop("a.service".into()),
            ]
        );
    }

    #[tokio::test]
    async fn configured_failures_are_reported() {
        let supervisor = RecordingSupervisor::new();
        supervisor.fail_start("bad.service");
        supervisor.fail_stop("stuck.service");

        assert_eq!(supervisor.start("bad.service").await.unwrap(), JobResult::Failed);
        assert!(!supervisor.is_running("bad.service"));

        supervisor.start("stuck.service").await.unwrap();
        assert_eq!(supervisor.stop("stuck.service").await.unwrap(), JobResult::Failed);
        assert!(supervisor.is_running("stuck.service"));
        supervisor.kill("stuck.service", 9).await.unwrap();
        assert!(!supervisor.is_running("stuck.service"));
    }

    #[tokio::test]
    async fn missing_systemctl_is_unavailable() {
        let result = SystemdSupervisor::connect_with(Path::new("/nonexistent/systemctl")).await;
        assert!(matches!(result, Err(ProcessError::Unavailable(_))));
    }
}
