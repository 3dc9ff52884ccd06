//! Composite: the pure grouping capability.
//!
//! A composite node exports no methods or streams; it only carries children.
//! Config-assembled trees use it as their root and for intermediate grouping
//! (a board, a rack slot).

use crate::driver::Driver;
use crate::registry::{CallStub, CapabilityClient, CapabilityRegistry, ProxyFactory};
use crate::report::DeviceRecord;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

pub const TAG: &str = "composite";

pub struct Composite;

#[async_trait]
impl Driver for Composite {
    fn capability(&self) -> &str {
        TAG
    }

    async fn call(&self, method: &str, _args: Value) -> anyhow::Result<Value> {
        anyhow::bail!("composite exports no method '{method}'")
    }
}

/// Client side of a composite node: nothing to call, the node exists for its
/// children.
pub struct CompositeClient;

impl CapabilityClient for CompositeClient {
    fn capability(&self) -> &str {
        TAG
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn register(registry: &mut CapabilityRegistry) {
    let factory: Arc<dyn ProxyFactory> =
        Arc::new(|_record: &DeviceRecord, _stub: Arc<dyn CallStub>| {
            Arc::new(CompositeClient) as Arc<dyn CapabilityClient>
        });
    registry.register(TAG, factory);
}
