//! Serial capability: a console byte stream plus line settings.
//!
//! The console is a raw duplex pipe tunneled through the router; the
//! transport never interprets its contents.

use crate::driver::{Driver, DuplexPipe};
use crate::error::BenchResult;
use crate::registry::{CallStub, CapabilityClient, CapabilityRegistry, ProxyFactory};
use crate::report::DeviceRecord;
use crate::router::StreamHandle;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

pub const TAG: &str = "serial";
pub const CONSOLE_STREAM: &str = "console";

/// Mock serial adapter that echoes console input back, prefixed per write.
/// Stands in for a real UART backend.
pub struct EchoSerial {
    baud: Mutex<u32>,
}

impl Default for EchoSerial {
    fn default() -> Self {
        Self {
            baud: Mutex::new(115_200),
        }
    }
}

#[async_trait]
impl Driver for EchoSerial {
    fn capability(&self) -> &str {
        TAG
    }

    fn stream_names(&self) -> Vec<&'static str> {
        vec![CONSOLE_STREAM]
    }

    async fn call(&self, method: &str, args: Value) -> anyhow::Result<Value> {
        match method {
            "set_baud" => {
                let baud = args
                    .get("baud")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| anyhow::anyhow!("missing 'baud' argument"))?;
                *self.baud.lock().await = baud as u32;
                Ok(Value::Null)
            }
            "get_baud" => Ok(json!({ "baud": *self.baud.lock().await })),
            other => anyhow::bail!("serial exports no method '{other}'"),
        }
    }

    async fn open_stream(&self, name: &str) -> anyhow::Result<DuplexPipe> {
        if name != CONSOLE_STREAM {
            anyhow::bail!("serial exports no stream named '{name}'");
        }

        let (near, far) = tokio::io::duplex(64 * 1024);

        // Echo task plays the device: everything written to the console
        // comes back.
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let mut buf = vec![0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(DuplexPipe::from_stream(near))
    }
}

/// Client-side serial proxy.
pub struct SerialClient {
    device: Uuid,
    stub: Arc<dyn CallStub>,
}

impl SerialClient {
    pub fn new(device: Uuid, stub: Arc<dyn CallStub>) -> Self {
        Self { device, stub }
    }

    pub async fn set_baud(&self, baud: u32) -> BenchResult<()> {
        self.stub
            .call(self.device, "set_baud", json!({ "baud": baud }))
            .await?;
        Ok(())
    }

    /// Open the console pipe. The returned handle carries raw bytes in both
    /// directions; bridge it to a local socket with [`crate::router::tunnel`].
    pub async fn console(&self) -> BenchResult<StreamHandle> {
        self.stub.open_stream(self.device, CONSOLE_STREAM).await
    }
}

impl CapabilityClient for SerialClient {
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
            Arc::new(SerialClient::new(record.uuid, stub)) as Arc<dyn CapabilityClient>
        });
    registry.register(TAG, factory);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_serial_echoes_console_bytes() {
        let driver = EchoSerial::default();
        let mut pipe = driver.open_stream(CONSOLE_STREAM).await.unwrap();

        pipe.writer.write_all(b"uname -a\n").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = pipe.reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"uname -a\n");
    }

    #[tokio::test]
    async fn unknown_stream_is_rejected() {
        let driver = EchoSerial::default();
        assert!(driver.open_stream("video").await.is_err());
    }

    #[tokio::test]
    async fn baud_roundtrip() {
        let driver = EchoSerial::default();
        driver
            .call("set_baud", json!({ "baud": 9600 }))
            .await
            .unwrap();
        let value = driver.call("get_baud", Value::Null).await.unwrap();
        assert_eq!(value["baud"], 9600);
    }
}
