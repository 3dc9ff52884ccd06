//! Discovery report: the wire projection of a driver tree.
//!
//! An exporter flattens its tree into an ordered sequence of
//! [`DeviceRecord`]s. Protocol requirement: a parent's record always precedes
//! its children's records; [`build_report`] emits exactly that order (root
//! first, then each child's subtree depth-first) and client reconstruction
//! relies on it. A record whose parent has not been seen is dropped with a
//! warning rather than failing the whole report.

use crate::driver::DriverNode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Wire form of one driver node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub uuid: Uuid,
    /// None for the root record.
    pub parent: Option<Uuid>,
    pub capability: String,
    pub labels: HashMap<String, String>,
}

impl DeviceRecord {
    /// The attachment name in the parent's namespace.
    pub fn name(&self) -> &str {
        self.labels
            .get(crate::driver::NAME_LABEL)
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// Flatten a tree into records, parent before child. Pure; a malformed tree
/// is rejected at construction time, never here.
pub fn build_report(root: &DriverNode) -> Vec<DeviceRecord> {
    let mut records = Vec::new();
    flatten(root, None, &mut records);
    records
}

fn flatten(node: &DriverNode, parent: Option<Uuid>, records: &mut Vec<DeviceRecord>) {
    records.push(DeviceRecord {
        uuid: node.uuid(),
        parent,
        capability: node.driver.capability().to_string(),
        labels: node.metadata.labels.clone(),
    });
    for child in node.children() {
        flatten(child, Some(node.uuid()), records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::composite::Composite;
    use crate::capability::power::MockPower;
    use std::sync::Arc;

    #[test]
    fn report_emits_parent_before_child() {
        let tree = DriverNode::new("root", Arc::new(Composite))
            .with_child(
                DriverNode::new("dut", Arc::new(Composite))
                    .with_child(DriverNode::new("power", Arc::new(MockPower::default()))),
            )
            .with_child(DriverNode::new("aux", Arc::new(Composite)));

        let records = build_report(&tree);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].parent, None);
        assert_eq!(records[0].name(), "root");

        let mut seen = std::collections::HashSet::new();
        for record in &records {
            if let Some(parent) = record.parent {
                assert!(seen.contains(&parent), "parent must precede child");
            }
            seen.insert(record.uuid);
        }
    }

    #[test]
    fn report_carries_capability_and_labels() {
        let tree = DriverNode::new("root", Arc::new(Composite)).with_child(
            DriverNode::new("power", Arc::new(MockPower::default())).with_label("rail", "main"),
        );

        let records = build_report(&tree);
        assert_eq!(records[0].capability, "composite");
        assert_eq!(records[1].capability, "power");
        assert_eq!(records[1].labels["rail"], "main");
        assert_eq!(records[1].parent, Some(records[0].uuid));
    }

    #[test]
    fn record_sequence_roundtrips_through_json() {
        let tree = DriverNode::new("root", Arc::new(Composite))
            .with_child(DriverNode::new("power", Arc::new(MockPower::default())));
        let records = build_report(&tree);

        let encoded = serde_json::to_vec(&records).unwrap();
        let decoded: Vec<DeviceRecord> = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, records);
    }
}
