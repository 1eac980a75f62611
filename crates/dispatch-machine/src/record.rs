//! Machine records as published under `machines/{m}/`.

use std::collections::BTreeMap;

use dispatch_store::codec::decode_pairs;
use dispatch_store::keys::{self, Keyspace, child_name};
use dispatch_store::{CoordinationStore, KeyValue, StoreResult};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineRecord {
    pub name: String,
    pub arch: Option<String>,
    pub public_ip: Option<String>,
    /// Last published load, `None` if never published or unreadable.
    pub load: Option<f64>,
    pub tags: BTreeMap<String, String>,
    /// The lease-bound liveness marker exists.
    pub alive: bool,
    /// Units assigned to the machine.
    pub units: Vec<String>,
}

impl MachineRecord {
    fn apply(&mut self, field: &str, value: &str) {
        match field.split_once('/') {
            Some((keys::MACHINE_UNITS, unit)) if !unit.is_empty() => {
                self.units.push(unit.to_string());
            }
            Some(_) => {}
            None => match field {
                keys::MACHINE_ARCH => self.arch = Some(value.to_string()),
                keys::MACHINE_IP => self.public_ip = Some(value.to_string()),
                keys::MACHINE_LOAD => {
                    self.load = value.trim().parse().ok();
                    if self.load.is_none() {
                        debug!(machine = %self.name, %value, "unreadable load");
                    }
                }
                keys::MACHINE_ALIVE => self.alive = true,
                keys::MACHINE_TAGS => self.tags = decode_pairs(value),
                _ => {}
            },
        }
    }

    fn group(keys: &Keyspace, kvs: Vec<KeyValue>) -> Vec<Self> {
        let prefix = keys.machines();
        let mut machines: BTreeMap<String, Self> = BTreeMap::new();
        for kv in kvs {
            let Some(name) = child_name(&prefix, &kv.key) else {
                continue;
            };
            let machine_prefix = keys.machine(name);
            let Some(field) = kv.key.strip_prefix(machine_prefix.as_str()) else {
                continue;
            };
            machines
                .entry(name.to_string())
                .or_insert_with(|| Self {
                    name: name.to_string(),
                    ..Self::default()
                })
                .apply(field, &kv.value);
        }
        machines.into_values().collect()
    }

    /// Every machine with any published key, ordered by name.
    pub async fn list_all(store: &dyn CoordinationStore, keys: &Keyspace) -> StoreResult<Vec<Self>> {
        let kvs = store.get_prefix(&keys.machines()).await?;
        Ok(Self::group(keys, kvs))
    }

    /// Machines whose liveness marker exists.
    pub async fn list_alive(store: &dyn CoordinationStore, keys: &Keyspace) -> StoreResult<Vec<Self>> {
        let mut machines = Self::list_all(store, keys).await?;
        machines.retain(|m| m.alive);
        Ok(machines)
    }

    pub async fn load(
        store: &dyn CoordinationStore,
        keys: &Keyspace,
        name: &str,
    ) -> StoreResult<Option<Self>> {
        let kvs = store.get_prefix(&keys.machine(name)).await?;
        Ok(Self::group(keys, kvs).into_iter().next())
    }
}
