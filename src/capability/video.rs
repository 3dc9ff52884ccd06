//! Video capability: a driver fronting an external streamer helper process.
//!
//! The driver does not touch video data itself; it starts and stops a
//! configured helper command (a ustreamer-style capture server) and keeps
//! its lifetime scoped to the driver. Releasing the driver terminates the
//! helper, gracefully first and forcibly after the grace period.

use crate::driver::{Driver, ScopedProcess, DEFAULT_GRACE};
use crate::error::{BenchError, BenchResult};
use crate::registry::{CallStub, CapabilityClient, CapabilityRegistry, ProxyFactory};
use crate::report::DeviceRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const TAG: &str = "video";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

/// Driver wrapping a long-running streamer command.
pub struct VideoStreamer {
    command: String,
    args: Vec<String>,
    grace: Duration,
    process: Mutex<Option<ScopedProcess>>,
}

impl VideoStreamer {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            grace: DEFAULT_GRACE,
            process: Mutex::new(None),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    async fn status(&self) -> StreamerStatus {
        let slot = self.process.lock().await;
        StreamerStatus {
            running: slot.is_some(),
            pid: slot.as_ref().and_then(ScopedProcess::id),
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(process) = self.process.lock().await.take() {
            process.terminate().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for VideoStreamer {
    fn capability(&self) -> &str {
        TAG
    }

    async fn call(&self, method: &str, _args: Value) -> anyhow::Result<Value> {
        match method {
            "start" => {
                let mut slot = self.process.lock().await;
                if slot.is_none() {
                    let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
                    let process =
                        ScopedProcess::spawn(&self.command, &args)?.with_grace(self.grace);
                    *slot = Some(process);
                }
                Ok(json!(StreamerStatus {
                    running: true,
                    pid: slot.as_ref().and_then(ScopedProcess::id),
                }))
            }
            "stop" => {
                self.stop().await?;
                Ok(json!(StreamerStatus {
                    running: false,
                    pid: None,
                }))
            }
            "status" => Ok(json!(self.status().await)),
            other => anyhow::bail!("video exports no method '{other}'"),
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.stop().await
    }
}

/// Client-side video proxy.
pub struct VideoClient {
    device: Uuid,
    stub: Arc<dyn CallStub>,
}

impl VideoClient {
    pub fn new(device: Uuid, stub: Arc<dyn CallStub>) -> Self {
        Self { device, stub }
    }

    pub async fn start(&self) -> BenchResult<StreamerStatus> {
        self.decode(self.stub.call(self.device, "start", Value::Null).await?)
    }

    pub async fn stop(&self) -> BenchResult<StreamerStatus> {
        self.decode(self.stub.call(self.device, "stop", Value::Null).await?)
    }

    pub async fn status(&self) -> BenchResult<StreamerStatus> {
        self.decode(self.stub.call(self.device, "status", Value::Null).await?)
    }

    fn decode(&self, value: Value) -> BenchResult<StreamerStatus> {
        serde_json::from_value(value)
            .map_err(|e| BenchError::Protocol(format!("malformed streamer status: {e}")))
    }
}

impl CapabilityClient for VideoClient {
    fn capability(&self) -> &str {
        TAG
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn register(registry: &mut CapabilityRegistry) {
    let factory: Arc<dyn ProxyFactory> =
        Arc::new(|record: &DeviceRecord, stub: Arc<dyn CallStub>| {
            Arc::new(VideoClient::new(record.uuid, stub)) as Arc<dyn CapabilityClient>
        });
    registry.register(TAG, factory);
}
