//! Client side of an exporter connection.
//!
//! [`Client::connect`] takes an established channel (the channel factory and
//! its credentials are a collaborator concern) and spawns the connection
//! plumbing; see [`crate::transport`]. Calls issued concurrently may complete
//! out of issue order; await each call before issuing the next if ordering
//! matters.

pub mod proxy;

pub use proxy::{DeviceProxy, ProxyTree};

pub use crate::transport::DEFAULT_CALL_TIMEOUT;

use crate::error::{BenchError, BenchResult};
use crate::protocol::{CallBody, OpenStreamBody, Operation, Response, Status, StreamOpened};
use crate::registry::{CallStub, CapabilityRegistry};
use crate::report::DeviceRecord;
use crate::router::StreamHandle;
use crate::transport::{Connection, ConnectionHandle};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

pub struct Client {
    handle: ConnectionHandle,
    registry: Arc<CapabilityRegistry>,
    tree: ProxyTree,
}

impl Client {
    /// Attach to an established channel. No I/O happens until the first
    /// request.
    pub fn connect<C>(channel: C, registry: Arc<CapabilityRegistry>) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            handle: Connection::spawn(channel),
            registry,
            tree: ProxyTree::default(),
        }
    }

    /// Fetch the current discovery report.
    pub async fn get_report(&self) -> BenchResult<Vec<DeviceRecord>> {
        let response = self
            .handle
            .conn
            .request(Operation::Report, String::new(), Vec::new(), None)
            .await?;
        let payload = check_status(response, "", "")?;
        serde_json::from_slice(&payload)
            .map_err(|e| BenchError::Protocol(format!("malformed report: {e}")))
    }

    /// Fetch the report and rebuild the local proxy tree from it.
    pub async fn sync(&mut self) -> BenchResult<&ProxyTree> {
        let records = self.get_report().await?;
        self.tree = proxy::reconstruct(
            &records,
            &self.registry,
            Arc::clone(&self.handle.conn) as Arc<dyn CallStub>,
        );
        Ok(&self.tree)
    }

    pub fn tree(&self) -> &ProxyTree {
        &self.tree
    }

    /// The shared transport stub, for hand-built capability clients.
    pub fn stub(&self) -> Arc<dyn CallStub> {
        Arc::clone(&self.handle.conn) as Arc<dyn CallStub>
    }

    /// Call a remote method directly by device identity.
    pub async fn call(&self, device: Uuid, method: &str, args: Value) -> BenchResult<Value> {
        self.handle.conn.call(device, method, args).await
    }

    /// Open a tunnel: bridge a remote device stream to a local endpoint
    /// until either side closes. Runs on the caller's task.
    pub async fn tunnel<E>(&self, device: Uuid, stream: &str, local: E) -> BenchResult<()>
    where
        E: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handle = self.handle.conn.open_stream(device, stream).await?;
        crate::router::tunnel(handle, local).await
    }

    /// Tear the connection down, cancelling outstanding calls and tunnels.
    pub async fn close(self) {
        self.handle.close().await;
    }
}

#[async_trait]
impl CallStub for Connection {
    async fn call(&self, device: Uuid, method: &str, args: Value) -> BenchResult<Value> {
        self.call_with_timeout(device, method, args, DEFAULT_CALL_TIMEOUT)
            .await
    }

    async fn call_with_timeout(
        &self,
        device: Uuid,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> BenchResult<Value> {
        let body = CallBody {
            method: method.to_string(),
            args,
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| BenchError::Protocol(format!("failed to encode call: {e}")))?;

        let response = self
            .request(Operation::Call, device.to_string(), payload, Some(timeout))
            .await?;
        let payload = check_status(response, &device.to_string(), method)?;
        serde_json::from_slice(&payload)
            .map_err(|e| BenchError::Protocol(format!("malformed call result: {e}")))
    }

    async fn open_stream(&self, device: Uuid, stream: &str) -> BenchResult<StreamHandle> {
        let body = OpenStreamBody {
            stream: stream.to_string(),
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| BenchError::Protocol(format!("failed to encode open-stream: {e}")))?;

        let response = self
            .request(Operation::OpenStream, device.to_string(), payload, None)
            .await?;
        let payload = check_status(response, &device.to_string(), stream)?;
        let opened: StreamOpened = serde_json::from_slice(&payload)
            .map_err(|e| BenchError::Protocol(format!("malformed stream id: {e}")))?;

        Ok(self.router.register(opened.stream_id).await)
    }
}

/// Map a response status to the typed error the caller should see. The
/// request context (device, method or stream name) is supplied by the call
/// site since the wire only carries the status and message.
pub(crate) fn check_status(
    response: Response,
    device: &str,
    operation: &str,
) -> BenchResult<Vec<u8>> {
    match response.status {
        Status::Ok => Ok(response.payload),
        Status::UnknownDevice => Err(BenchError::UnknownDevice(device.to_string())),
        Status::UnknownStream => Err(BenchError::UnknownStream {
            device: device.to_string(),
            stream: operation.to_string(),
        }),
        Status::DriverError => Err(BenchError::Driver {
            device: device.to_string(),
            method: operation.to_string(),
            message: response.error_message,
        }),
        Status::NoMatch => Err(BenchError::NoMatch),
        Status::LeaseNotFound => Err(BenchError::LeaseNotFound(response.error_message)),
        Status::NotOwned => Err(BenchError::NotOwned(response.error_message)),
        Status::InvalidRequest => Err(BenchError::InvalidRequest(response.error_message)),
        Status::Internal => Err(BenchError::Internal(response.error_message)),
    }
}
