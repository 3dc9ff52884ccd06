//! Client-side device proxies reconstructed from a discovery report.
//!
//! Proxies mirror the exporter's tree but are independently owned by the
//! client; dropping one never affects the remote node. Children live in an
//! explicit ordered name -> proxy mapping with lookup and iteration as
//! first-class operations.
//!
//! Reconstruction requires parent records before child records (a protocol
//! requirement; [`crate::report::build_report`] emits exactly that order).
//! Records with an unregistered capability tag are skipped with a warning —
//! newer exporters may report capabilities this client does not know — and
//! so are records whose parent was not reconstructed.

use crate::registry::{CallStub, CapabilityClient, CapabilityRegistry};
use crate::report::DeviceRecord;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// One reconstructed device: identity, labels, resolved capability behavior
/// and an ordered child namespace.
pub struct DeviceProxy {
    uuid: Uuid,
    labels: HashMap<String, String>,
    capability: String,
    client: Arc<dyn CapabilityClient>,
    children: Vec<DeviceProxy>,
}

impl DeviceProxy {
    fn new(record: &DeviceRecord, client: Arc<dyn CapabilityClient>) -> Self {
        Self {
            uuid: record.uuid,
            labels: record.labels.clone(),
            capability: record.capability.clone(),
            client,
            children: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        self.labels
            .get(crate::driver::NAME_LABEL)
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// The typed capability client, when `T` matches the registered behavior.
    pub fn client<T: 'static>(&self) -> Option<&T> {
        self.client.as_any().downcast_ref::<T>()
    }

    /// Look up a child by its attachment name.
    pub fn child(&self, name: &str) -> Option<&DeviceProxy> {
        self.children.iter().find(|c| c.name() == name)
    }

    /// Children in report order.
    pub fn children(&self) -> impl Iterator<Item = &DeviceProxy> {
        self.children.iter()
    }
}

/// The root-level namespace of a reconstructed report.
#[derive(Default)]
pub struct ProxyTree {
    roots: Vec<DeviceProxy>,
}

impl ProxyTree {
    pub fn root(&self, name: &str) -> Option<&DeviceProxy> {
        self.roots.iter().find(|p| p.name() == name)
    }

    pub fn roots(&self) -> impl Iterator<Item = &DeviceProxy> {
        self.roots.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Every proxy in the tree, depth first.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceProxy> {
        let mut all = Vec::new();
        fn walk<'a>(proxy: &'a DeviceProxy, out: &mut Vec<&'a DeviceProxy>) {
            out.push(proxy);
            for child in proxy.children() {
                walk(child, out);
            }
        }
        for root in &self.roots {
            walk(root, &mut all);
        }
        all.into_iter()
    }
}

/// Rebuild a proxy tree from a record sequence.
///
/// Unresolvable records (unknown tag, unresolved parent) are skipped with a
/// warning; the remaining records still reconstruct. No error escapes.
pub fn reconstruct(
    records: &[DeviceRecord],
    registry: &CapabilityRegistry,
    stub: Arc<dyn CallStub>,
) -> ProxyTree {
    let mut slots: Vec<Option<DeviceProxy>> = Vec::with_capacity(records.len());
    let mut parents: Vec<Option<Uuid>> = Vec::with_capacity(records.len());
    let mut index: HashMap<Uuid, usize> = HashMap::with_capacity(records.len());

    for record in records {
        if let Some(parent) = record.parent {
            if !index.contains_key(&parent) {
                warn!(
                    device = %record.uuid,
                    parent = %parent,
                    "skipping record: parent not reconstructed (records must arrive parent first)"
                );
                continue;
            }
        }

        let Some(factory) = registry.resolve(&record.capability) else {
            warn!(
                device = %record.uuid,
                capability = %record.capability,
                "skipping record with unknown capability tag"
            );
            continue;
        };

        let proxy = DeviceProxy::new(record, factory.build(record, Arc::clone(&stub)));
        index.insert(record.uuid, slots.len());
        parents.push(record.parent);
        slots.push(Some(proxy));
    }

    // Attach children to parents back to front; prepending restores report
    // order. Parents always sit at a lower index than their children.
    for i in (0..slots.len()).rev() {
        let Some(parent_uuid) = parents[i] else {
            continue;
        };
        let Some(child) = slots[i].take() else {
            continue;
        };
        if let Some(&parent_index) = index.get(&parent_uuid) {
            if let Some(parent) = slots[parent_index].as_mut() {
                parent.children.insert(0, child);
            }
        }
    }

    ProxyTree {
        roots: slots.into_iter().flatten().collect(),
    }
}
