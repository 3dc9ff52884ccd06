//! Capability registry: resolves a capability tag received on the wire into
//! a locally known client behavior.
//!
//! The registry is an explicit object constructed once at process start and
//! handed to every component that resolves tags — there is no load-time
//! global state. Lookup is O(1) by exact tag; a miss is a recoverable
//! condition handled by the caller (reconstruction skips the record with a
//! warning), never a crash.

use crate::error::BenchResult;
use crate::report::DeviceRecord;
use crate::router::StreamHandle;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Shared transport stub a capability client forwards every operation to:
/// "call remote method M on device I with arguments A" and "open stream S on
/// device I".
#[async_trait]
pub trait CallStub: Send + Sync {
    async fn call(&self, device: Uuid, method: &str, args: Value) -> BenchResult<Value>;

    async fn call_with_timeout(
        &self,
        device: Uuid,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> BenchResult<Value>;

    async fn open_stream(&self, device: Uuid, stream: &str) -> BenchResult<StreamHandle>;
}

/// Client-side behavior for one capability. Concrete clients (PowerClient,
/// SerialClient, ...) are recovered via [`CapabilityClient::as_any`]
/// downcasting.
pub trait CapabilityClient: Send + Sync {
    fn capability(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

/// Produces the client behavior for one capability tag.
pub trait ProxyFactory: Send + Sync {
    fn build(&self, record: &DeviceRecord, stub: Arc<dyn CallStub>) -> Arc<dyn CapabilityClient>;
}

impl<F> ProxyFactory for F
where
    F: Fn(&DeviceRecord, Arc<dyn CallStub>) -> Arc<dyn CapabilityClient> + Send + Sync,
{
    fn build(&self, record: &DeviceRecord, stub: Arc<dyn CallStub>) -> Arc<dyn CapabilityClient> {
        self(record, stub)
    }
}

/// Tag -> factory map. Populated before first use, read-only afterwards.
#[derive(Default)]
pub struct CapabilityRegistry {
    factories: HashMap<String, Arc<dyn ProxyFactory>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: impl Into<String>, factory: Arc<dyn ProxyFactory>) {
        self.factories.insert(tag.into(), factory);
    }

    pub fn resolve(&self, tag: &str) -> Option<&Arc<dyn ProxyFactory>> {
        self.factories.get(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
