//! System load sampling.
//!
//! The scheduler places units on the machine with the lowest published
//! one-minute load average.

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{MachineError, MachineResult};

#[async_trait]
pub trait LoadSource: Send + Sync {
    async fn sample(&self) -> MachineResult<f64>;
}

/// Reads `/proc/loadavg`, falling back to parsing `uptime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoad;

#[async_trait]
impl LoadSource for SystemLoad {
    async fn sample(&self) -> MachineResult<f64> {
        if let Ok(raw) = tokio::fs::read_to_string("/proc/loadavg").await {
            return parse_loadavg(&raw)
                .ok_or_else(|| MachineError::Load(format!("unexpected /proc/loadavg: {raw}")));
        }
        let output = Command::new("uptime").output().await?;
        let text = String::from_utf8_lossy(&output.stdout);
        parse_uptime(&text)
            .ok_or_else(|| MachineError::Load(format!("unexpected uptime output: {text}")))
    }
}

/// A fixed load value.
#[derive(Debug, Clone, Copy)]
pub struct StaticLoad(pub f64);

#[async_trait]
impl LoadSource for StaticLoad {
    async fn sample(&self) -> MachineResult<f64> {
        Ok(self.0)
    }
}

/// First field of `/proc/loadavg`.
pub fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// First value after `load average:` (Linux) or `load averages:` (BSD).
pub fn parse_uptime(raw: &str) -> Option<f64> {
    let start = raw.find("load average")?;
    let (_, values) = raw[start..].split_once(':')?;
    values
        .split(|c: char| c == ',' || c.is_whitespace())
        .find(|s| !s.is_empty())?
        .parse()
        .ok()
}
