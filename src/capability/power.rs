//! Power capability: switch a device under test on and off and read back
//! the rail state.

use crate::driver::Driver;
use crate::error::{BenchError, BenchResult};
use crate::registry::{CallStub, CapabilityClient, CapabilityRegistry, ProxyFactory};
use crate::report::DeviceRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const TAG: &str = "power";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub on: bool,
    pub voltage: f64,
    pub current: f64,
}

/// Mock power relay. Stands in for a real relay backend in tests and local
/// setups.
pub struct MockPower {
    state: Mutex<bool>,
    voltage: f64,
}

impl Default for MockPower {
    fn default() -> Self {
        Self {
            state: Mutex::new(false),
            voltage: 5.0,
        }
    }
}

impl MockPower {
    pub fn with_voltage(voltage: f64) -> Self {
        Self {
            state: Mutex::new(false),
            voltage,
        }
    }
}

#[async_trait]
impl Driver for MockPower {
    fn capability(&self) -> &str {
        TAG
    }

    async fn call(&self, method: &str, _args: Value) -> anyhow::Result<Value> {
        match method {
            "on" => {
                *self.state.lock().await = true;
                Ok(Value::Null)
            }
            "off" => {
                *self.state.lock().await = false;
                Ok(Value::Null)
            }
            "read" => {
                let on = *self.state.lock().await;
                let reading = PowerReading {
                    on,
                    voltage: if on { self.voltage } else { 0.0 },
                    current: if on { 0.42 } else { 0.0 },
                };
                Ok(json!(reading))
            }
            other => anyhow::bail!("power exports no method '{other}'"),
        }
    }
}

/// Client-side power proxy: typed stub methods forwarding to the shared
/// transport.
pub struct PowerClient {
    device: Uuid,
    stub: Arc<dyn CallStub>,
}

impl PowerClient {
    pub fn new(device: Uuid, stub: Arc<dyn CallStub>) -> Self {
        Self { device, stub }
    }

    pub async fn on(&self) -> BenchResult<()> {
        self.stub.call(self.device, "on", Value::Null).await?;
        Ok(())
    }

    pub async fn off(&self) -> BenchResult<()> {
        self.stub.call(self.device, "off", Value::Null).await?;
        Ok(())
    }

    pub async fn read(&self) -> BenchResult<PowerReading> {
        let value = self.stub.call(self.device, "read", Value::Null).await?;
        serde_json::from_value(value)
            .map_err(|e| BenchError::Protocol(format!("malformed power reading: {e}")))
    }
}

impl CapabilityClient for PowerClient {
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
            Arc::new(PowerClient::new(record.uuid, stub)) as Arc<dyn CapabilityClient>
        });
    registry.register(TAG, factory);
}
