//! Templates — wildcard-named blueprints that instantiate units.
//!
//! A template named `web-*` with `max_per_machine = 1` stamps out
//! `web-1.service`, `web-2.service`, ... and keeps the scheduler from
//! placing two of them on one machine. Content is rendered with tera,
//! so a body can refer to `{{ name }}` and any caller-supplied variable.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dispatch_store::codec::{decode_pairs, decode_ports, encode_pairs, encode_ports};
use dispatch_store::keys::{self, Keyspace, child_name, last_segment};
use dispatch_store::{CoordinationStore, StoreCache};
use tera::{Context, Tera};
use tracing::{debug, warn};

use crate::error::{UnitError, UnitResult};
use crate::state::UnitState;
use crate::unit::{Unit, normalize_name};

/// Placeholder replaced by the instance name.
pub const WILDCARD: char = '*';

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    /// Wildcard name, containing exactly one `*`.
    pub name: String,
    pub content: String,
    pub ports: BTreeSet<u16>,
    /// Upper bound of instances per machine, 0 for unlimited.
    pub max_per_machine: u32,
    pub constraints: BTreeMap<String, String>,
}

fn validate_name(name: &str) -> UnitResult<()> {
    if name.matches(WILDCARD).count() == 1 {
        Ok(())
    } else {
        Err(UnitError::InvalidTemplateName(name.to_string()))
    }
}

impl Template {
    pub fn new(name: &str, content: impl Into<String>) -> UnitResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            content: content.into(),
            ..Self::default()
        })
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    pub fn with_max_per_machine(mut self, max: u32) -> Self {
        self.max_per_machine = max;
        self
    }

    fn from_fields(
        name: &str,
        fields: impl IntoIterator<Item = (String, String)>,
    ) -> Option<Self> {
        let mut template = Self::default();
        let mut seen = false;
        for (key, value) in fields {
            seen = true;
            match last_segment(&key) {
                keys::TEMPLATE_NAME => template.name = value,
                keys::TEMPLATE_CONTENT => template.content = value,
                keys::TEMPLATE_PORTS => template.ports = decode_ports(&value),
                keys::TEMPLATE_CONSTRAINTS => template.constraints = decode_pairs(&value),
                keys::TEMPLATE_MAX_PER_MACHINE => {
                    template.max_per_machine = value.trim().parse().unwrap_or_else(|_| {
                        warn!(template = name, value = %value, "invalid maxpermachine, treating as unlimited");
                        0
                    });
                }
                _ => {}
            }
        }
        if !seen {
            return None;
        }
        if template.name.is_empty() {
            template.name = name.to_string();
        }
        Some(template)
    }

    pub async fn load(
        store: &dyn CoordinationStore,
        keys: &Keyspace,
        name: &str,
    ) -> UnitResult<Option<Self>> {
        let kvs = store.get_prefix(&keys.template(name)).await?;
        Ok(Self::from_fields(
            name,
            kvs.into_iter().map(|kv| (kv.key, kv.value)),
        ))
    }

    pub async fn load_cached(
        cache: &mut StoreCache,
        keys: &Keyspace,
        name: &str,
    ) -> UnitResult<Option<Self>> {
        let fields = cache.get_all(&keys.template(name)).await?;
        Ok(Self::from_fields(name, fields))
    }

    pub async fn list_all(store: &dyn CoordinationStore, keys: &Keyspace) -> UnitResult<Vec<Self>> {
        let prefix = keys.templates();
        let mut grouped: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for kv in store.get_prefix(&prefix).await? {
            if let Some(name) = child_name(&prefix, &kv.key) {
                grouped
                    .entry(name.to_string())
                    .or_default()
                    .push((kv.key, kv.value));
            }
        }
        Ok(grouped
            .into_iter()
            .filter_map(|(name, fields)| Self::from_fields(&name, fields))
            .collect())
    }

    pub async fn save(&self, store: &dyn CoordinationStore, keys: &Keyspace) -> UnitResult<()> {
        validate_name(&self.name)?;
        let fields = [
            (keys::TEMPLATE_CONTENT, self.content.clone()),
            (keys::TEMPLATE_PORTS, encode_ports(&self.ports)),
            (keys::TEMPLATE_MAX_PER_MACHINE, self.max_per_machine.to_string()),
            (keys::TEMPLATE_CONSTRAINTS, encode_pairs(&self.constraints)),
            (keys::TEMPLATE_NAME, self.name.clone()),
        ];
        for (field, value) in fields {
            store
                .put(&keys.template_field(&self.name, field), &value, None)
                .await?;
        }
        debug!(template = %self.name, "template saved");
        Ok(())
    }

    pub async fn delete(
        store: &dyn CoordinationStore,
        keys: &Keyspace,
        name: &str,
    ) -> UnitResult<bool> {
        Ok(store.delete_prefix(&keys.template(name)).await? > 0)
    }

    /// Instantiate an unsaved unit named after `instance`.
    ///
    /// The first `*` of the template name is replaced by `instance` and
    /// the content is rendered with `vars` plus `name = instance`. Ports
    /// are copied; constraints are left for the caller to add.
    pub fn new_unit(&self, instance: &str, vars: &HashMap<String, String>) -> UnitResult<Unit> {
        validate_name(&self.name)?;
        let name = normalize_name(&self.name.replacen(WILDCARD, instance, 1))?;

        let mut context = Context::new();
        for (key, value) in vars {
            context.insert(key.as_str(), value);
        }
        context.insert("name", instance);
        let content = Tera::one_off(&self.content, &context, false).map_err(|e| {
            UnitError::Render {
                template: self.name.clone(),
                detail: e.to_string(),
            }
        })?;

        Ok(Unit {
            name,
            template: Some(self.name.clone()),
            desired_state: UnitState::Active,
            ports: self.ports.clone(),
            content,
            ..Unit::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use dispatch_store::EmbeddedStore;

    use super::*;

    #[test]
    fn name_needs_exactly_one_wildcard() {
        assert!(Template::new("web-*", "").is_ok());
        assert!(matches!(
            Template::new("web", ""),
            Err(UnitError::InvalidTemplateName(_))
        ));
        assert!(Template::new("*-*", "").is_err());
    }

    #[test]
    fn new_unit_substitutes_name_and_renders() {
        let template = Template::new(
            "web-*",
            "[Service]\nExecStart=/usr/bin/web --id {{ name }} --env {{ env }}\n",
        )
        .unwrap()
        .with_ports([8080])
        .with_max_per_machine(1);

        let vars = HashMap::from([("env".to_string(), "prod".to_string())]);
        let unit = template.new_unit("3", &vars).unwrap();

        assert_eq!(unit.name, "web-3.service");
        assert_eq!(unit.template.as_deref(), Some("web-*"));
        assert_eq!(unit.desired_state, UnitState::Active);
        assert!(unit.ports.contains(&8080));
        assert!(unit.content.contains("--id 3 --env prod"));
        assert!(!unit.on_store);
    }

    #[test]
    fn constraints_are_not_copied() {
        let mut template = Template::new("db-*", "").unwrap();
        template.constraints.insert("disk".into(), "ssd".into());
        let unit = template.new_unit("a", &HashMap::new()).unwrap();
        assert!(unit.constraints.is_empty());
    }

    #[test]
    fn broken_template_reports_render_error() {
        let template = Template::new("x-*", "{{ unclosed").unwrap();
        let result = template.new_unit("1", &HashMap::new());
        assert!(matches!(result, Err(UnitError::Render { .. })));
    }

    #[tokio::test]
    async fn save_load_delete() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let keys = Keyspace::new("test");
        let template = Template::new("t-*", "body").unwrap().with_max_per_machine(2);
        template.save(&store, &keys).await.unwrap();

        let loaded = Template::load(&store, &keys, "t-*").await.unwrap().unwrap();
        assert_eq!(loaded, template);
        assert_eq!(Template::list_all(&store, &keys).await.unwrap().len(), 1);

        assert!(Template::delete(&store, &keys, "t-*").await.unwrap());
        assert!(Template::load(&store, &keys, "t-*").await.unwrap().is_none());
    }
}
