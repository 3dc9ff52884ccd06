//! Driver tree: the in-memory hierarchy a bench exporter serves.
//!
//! A [`DriverNode`] pairs stable identity metadata with a capability
//! implementation (a [`Driver`]) and exclusively owns its children, so a
//! child's lifetime can never exceed its parent's and no node can hang off
//! two parents. Identity uniqueness is still checked explicitly at
//! construction time via [`DriverNode::validate`]; a violation is a
//! [`BenchError::Structure`] raised before the tree is ever served.
//!
//! Drivers expose two kinds of sub-resources:
//!
//! - exported methods, dispatched by name with JSON arguments, and
//! - exported streams, duplex byte pipe factories dispatched by name.
//!
//! Concrete hardware backends live outside this crate; [`crate::capability`]
//! carries the reference implementations used in tests and examples.

pub mod process;

pub use process::{ScopedProcess, DEFAULT_GRACE};

use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Label key under which a node's attachment name is stored.
pub const NAME_LABEL: &str = "name";

/// Both halves of an exported duplex pipe.
pub struct DuplexPipe {
    pub reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    pub writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
}

impl DuplexPipe {
    pub fn new(
        reader: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Wrap a combined read/write endpoint (e.g. a socket or an in-memory
    /// duplex half) by splitting it.
    pub fn from_stream(
        stream: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Identity and label metadata carried by every driver node.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub uuid: Uuid,
    pub labels: HashMap<String, String>,
}

impl Metadata {
    pub fn new(name: impl Into<String>) -> Self {
        let mut labels = HashMap::new();
        labels.insert(NAME_LABEL.to_string(), name.into());
        Self {
            uuid: Uuid::new_v4(),
            labels,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The attachment name in the parent's namespace.
    pub fn name(&self) -> &str {
        self.labels
            .get(NAME_LABEL)
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// Server-side capability implementation.
///
/// Implementations must be cancellation-safe: a call aborted by connection
/// shutdown is a normal abort path and must leave the device consistent.
/// Errors use `anyhow` inside drivers; the exporter service wraps them with
/// device and method context before they reach the wire.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Capability tag naming the interface this driver implements.
    fn capability(&self) -> &str;

    /// Names of the streams this driver exports.
    fn stream_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Dispatch an exported method by name.
    async fn call(&self, method: &str, args: Value) -> anyhow::Result<Value>;

    /// Open an exported stream by name. Only called for names listed in
    /// [`Driver::stream_names`].
    async fn open_stream(&self, name: &str) -> anyhow::Result<DuplexPipe> {
        anyhow::bail!("driver exports no stream named '{name}'")
    }

    /// Release the underlying resource. Called exactly once per node during
    /// session teardown, children before parents.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One node of the exported tree: metadata, capability implementation and
/// exclusively owned children.
pub struct DriverNode {
    pub metadata: Metadata,
    pub driver: Arc<dyn Driver>,
    children: Vec<DriverNode>,
}

impl DriverNode {
    pub fn new(name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        Self {
            metadata: Metadata::new(name),
            driver,
            children: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata = self.metadata.with_label(key, value);
        self
    }

    pub fn with_child(mut self, child: DriverNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.metadata.uuid
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn children(&self) -> &[DriverNode] {
        &self.children
    }

    /// Check tree invariants: every identity unique within the snapshot.
    ///
    /// Single-parent reachability is already enforced by ownership (children
    /// are owned by value), so duplicate identities are the only structural
    /// corruption left to detect.
    pub fn validate(&self) -> BenchResult<()> {
        let mut seen = HashSet::new();
        self.validate_inner(&mut seen)
    }

    fn validate_inner(&self, seen: &mut HashSet<Uuid>) -> BenchResult<()> {
        if !seen.insert(self.uuid()) {
            return Err(BenchError::Structure(format!(
                "duplicate device identity {} in tree",
                self.uuid()
            )));
        }
        for child in &self.children {
            child.validate_inner(seen)?;
        }
        Ok(())
    }

    /// Locate a node anywhere in the tree by identity.
    pub fn find(&self, uuid: Uuid) -> Option<&DriverNode> {
        if self.uuid() == uuid {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(uuid))
    }

    /// All nodes in post order: children strictly before their parent.
    /// This is the teardown order.
    pub fn post_order(&self) -> Vec<&DriverNode> {
        let mut nodes = Vec::new();
        self.collect_post_order(&mut nodes);
        nodes
    }

    fn collect_post_order<'a>(&'a self, nodes: &mut Vec<&'a DriverNode>) {
        for child in &self.children {
            child.collect_post_order(nodes);
        }
        nodes.push(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::composite::Composite;

    fn group(name: &str) -> DriverNode {
        DriverNode::new(name, Arc::new(Composite))
    }

    #[test]
    fn name_comes_from_label() {
        let node = group("dut");
        assert_eq!(node.name(), "dut");
        assert_eq!(node.metadata.labels[NAME_LABEL], "dut");
    }

    #[test]
    fn validate_accepts_well_formed_tree() {
        let tree = group("root").with_child(group("a").with_child(group("b")));
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_identity() {
        let mut child = group("a");
        let root = group("root");
        child.metadata.uuid = root.metadata.uuid;
        let tree = root.with_child(child);

        match tree.validate() {
            Err(BenchError::Structure(_)) => {}
            other => panic!("expected Structure error, got {other:?}"),
        }
    }

    #[test]
    fn post_order_puts_children_before_parents() {
        let leaf = group("leaf");
        let leaf_id = leaf.uuid();
        let mid = group("mid").with_child(leaf);
        let mid_id = mid.uuid();
        let root = group("root").with_child(mid);
        let root_id = root.uuid();

        let order: Vec<Uuid> = root.post_order().iter().map(|n| n.uuid()).collect();
        assert_eq!(order, vec![leaf_id, mid_id, root_id]);
    }

    #[test]
    fn find_locates_nested_nodes() {
        let leaf = group("leaf");
        let leaf_id = leaf.uuid();
        let tree = group("root").with_child(group("mid").with_child(leaf));

        assert_eq!(tree.find(leaf_id).map(|n| n.name()), Some("leaf"));
        assert!(tree.find(Uuid::new_v4()).is_none());
    }
}
