//! Reference capability implementations.
//!
//! Each capability pairs a server-side [`crate::driver::Driver`] with a
//! client-side proxy behavior registered under the same tag. Real hardware
//! backends are external collaborators; the implementations here are the
//! built-in grouping node, mock power and serial devices used by tests and
//! local setups, and a video driver scoping an external streamer helper.

pub mod composite;
pub mod power;
pub mod serial;
pub mod video;

use crate::config::DriverInstance;
use crate::driver::{Driver, DriverNode};
use crate::error::{BenchError, BenchResult};
use crate::registry::CapabilityRegistry;
use std::collections::HashMap;
use std::sync::Arc;

/// A registry populated with the built-in capabilities (`composite`,
/// `power`, `serial`, `video`). Callers extend it with their own tags before
/// handing it to a client.
pub fn builtin_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    composite::register(&mut registry);
    power::register(&mut registry);
    serial::register(&mut registry);
    video::register(&mut registry);
    registry
}

/// Server-side driver builder: instantiates a [`Driver`] from its config
/// table.
pub trait DriverFactory: Send + Sync {
    fn build(&self, config: &HashMap<String, toml::Value>) -> anyhow::Result<Arc<dyn Driver>>;
}

impl<F> DriverFactory for F
where
    F: Fn(&HashMap<String, toml::Value>) -> anyhow::Result<Arc<dyn Driver>> + Send + Sync,
{
    fn build(&self, config: &HashMap<String, toml::Value>) -> anyhow::Result<Arc<dyn Driver>> {
        self(config)
    }
}

/// Capability tag -> server-side driver factory. The exporter consults it
/// when assembling its tree from the config `[export]` section.
#[derive(Default)]
pub struct DriverCatalog {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: impl Into<String>, factory: Arc<dyn DriverFactory>) {
        self.factories.insert(tag.into(), factory);
    }

    pub fn resolve(&self, tag: &str) -> Option<&Arc<dyn DriverFactory>> {
        self.factories.get(tag)
    }
}

/// A catalog knowing the built-in drivers. `power` honors an optional
/// `voltage` setting; `video` requires a `command` and takes optional
/// `args`; `composite` and `serial` take none.
pub fn builtin_catalog() -> DriverCatalog {
    let mut catalog = DriverCatalog::new();
    catalog.register(
        composite::TAG,
        Arc::new(|_: &HashMap<String, toml::Value>| {
            Ok(Arc::new(composite::Composite) as Arc<dyn Driver>)
        }),
    );
    catalog.register(
        power::TAG,
        Arc::new(|config: &HashMap<String, toml::Value>| {
            let driver = match config.get("voltage").and_then(toml::Value::as_float) {
                Some(voltage) => power::MockPower::with_voltage(voltage),
                None => power::MockPower::default(),
            };
            Ok(Arc::new(driver) as Arc<dyn Driver>)
        }),
    );
    catalog.register(
        serial::TAG,
        Arc::new(|_: &HashMap<String, toml::Value>| {
            Ok(Arc::new(serial::EchoSerial::default()) as Arc<dyn Driver>)
        }),
    );
    catalog.register(
        video::TAG,
        Arc::new(|config: &HashMap<String, toml::Value>| {
            let command = config
                .get("command")
                .and_then(toml::Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("video driver requires a 'command' setting"))?;
            let args = config
                .get("args")
                .and_then(toml::Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(toml::Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Arc::new(video::VideoStreamer::new(command, args)) as Arc<dyn Driver>)
        }),
    );
    catalog
}

/// Build the exported tree described by the config `[export]` section: a
/// composite root named `root_name` carrying one subtree per named instance.
/// Children are attached in name order so the report is deterministic.
pub fn assemble_tree(
    root_name: &str,
    instances: &HashMap<String, DriverInstance>,
    catalog: &DriverCatalog,
) -> BenchResult<DriverNode> {
    let mut root = DriverNode::new(root_name, Arc::new(composite::Composite));
    let mut names: Vec<&String> = instances.keys().collect();
    names.sort();
    for name in names {
        root = root.with_child(assemble_node(name, &instances[name], catalog)?);
    }
    root.validate()?;
    Ok(root)
}

fn assemble_node(
    name: &str,
    instance: &DriverInstance,
    catalog: &DriverCatalog,
) -> BenchResult<DriverNode> {
    let factory = catalog
        .resolve(&instance.capability)
        .ok_or_else(|| BenchError::UnknownCapability(instance.capability.clone()))?;
    let driver = factory.build(&instance.config).map_err(|e| {
        BenchError::Structure(format!("failed to build driver '{name}': {e}"))
    })?;

    let mut node = DriverNode::new(name, driver);
    for (key, value) in &instance.labels {
        node = node.with_label(key, value);
    }
    let mut child_names: Vec<&String> = instance.children.keys().collect();
    child_names.sort();
    for child_name in child_names {
        node = node.with_child(assemble_node(
            child_name,
            &instance.children[child_name],
            catalog,
        )?);
    }
    Ok(node)
}
