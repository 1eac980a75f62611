//! dispatchd configuration.
//!
//! Resolution order: built-in defaults, then the optional `--config`
//! TOML file, then command-line flags and `DISPATCH_*` environment
//! variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Args;
use dispatch_machine::AgentConfig;
use dispatch_store::Keyspace;
use dispatch_store::codec::decode_pairs;
use dispatch_supervisor::SupervisorConfig;
use dispatch_unit::DEFAULT_UNIT_DIR;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Unique within the zone. Defaults to the host name.
    pub machine_name: String,
    pub zone: String,
    pub store_endpoints: Vec<String>,
    pub public_ip: Option<String>,
    pub arch: String,
    pub tags: BTreeMap<String, String>,
    /// Runtime directory for materialized unit files.
    pub unit_dir: PathBuf,
    pub lease_ttl_secs: u64,
    pub keepalive_secs: u64,
    pub check_interval_secs: u64,
    pub schedule_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            machine_name: hostname().unwrap_or_default(),
            zone: "dc".to_string(),
            store_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            public_ip: None,
            arch: std::env::consts::ARCH.to_string(),
            tags: BTreeMap::new(),
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            lease_ttl_secs: 10,
            keepalive_secs: 1,
            check_interval_secs: 10,
            schedule_interval_secs: 5,
        }
    }
}

/// Flags that override the configuration file.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Machine name.
    #[arg(long, global = true, env = "DISPATCH_MACHINENAME")]
    pub machine_name: Option<String>,

    /// Cluster zone.
    #[arg(long, global = true, env = "DISPATCH_ZONE")]
    pub zone: Option<String>,

    /// Store endpoints, comma separated.
    #[arg(long, global = true, env = "DISPATCH_ETCDADDRESS")]
    pub etcd_address: Option<String>,

    /// Public IP address published for this machine.
    #[arg(long, global = true, env = "DISPATCH_PUBLICIP")]
    pub public_ip: Option<String>,

    /// Machine architecture.
    #[arg(long, global = true, env = "DISPATCH_ARCH")]
    pub arch: Option<String>,

    /// Machine tags as `k=v,k=v`.
    #[arg(long, global = true, env = "DISPATCH_TAGS")]
    pub tags: Option<String>,
}

impl DispatchConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Defaults, optionally replaced by a file.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, args: &ConfigArgs) {
        if let Some(name) = &args.machine_name {
            self.machine_name = name.clone();
        }
        if let Some(zone) = &args.zone {
            self.zone = zone.clone();
        }
        if let Some(address) = &args.etcd_address {
            self.store_endpoints = address
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(ip) = &args.public_ip {
            self.public_ip = Some(ip.clone());
        }
        if let Some(arch) = &args.arch {
            self.arch = arch.clone();
        }
        if let Some(tags) = &args.tags {
            self.tags = decode_pairs(tags);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.machine_name.trim().is_empty() {
            bail!("machine name must not be empty");
        }
        if self.machine_name.contains('/') {
            bail!("machine name must not contain '/'");
        }
        if self.zone.trim().is_empty() {
            bail!("zone must not be empty");
        }
        if self.store_endpoints.is_empty() {
            bail!("at least one store endpoint is required");
        }
        if self.keepalive_secs == 0 || self.keepalive_secs >= self.lease_ttl_secs {
            bail!(
                "keepalive period ({}s) must be positive and below the lease TTL ({}s)",
                self.keepalive_secs,
                self.lease_ttl_secs
            );
        }
        if self.check_interval_secs == 0 || self.schedule_interval_secs == 0 {
            bail!("check and schedule intervals must be positive");
        }
        Ok(())
    }

    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.zone)
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::new(&self.machine_name);
        config.arch = self.arch.clone();
        config.public_ip = self.public_ip.clone();
        config.tags = self.tags.clone();
        config.lease_ttl = Duration::from_secs(self.lease_ttl_secs);
        config.keepalive_interval = Duration::from_secs(self.keepalive_secs);
        config.check_interval = Duration::from_secs(self.check_interval_secs);
        config
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_secs),
            schedule_interval: Duration::from_secs(self.schedule_interval_secs),
            vacancy_check_interval: Duration::from_secs(self.check_interval_secs),
            ..SupervisorConfig::default()
        }
    }
}

fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}
