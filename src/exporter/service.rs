//! The exporter RPC surface: one state machine per connection.
//!
//! A connection moves Connected → Serving → Closing → Closed. While Serving
//! it answers `GetReport`, `Call` and `OpenStream`; every per-call failure
//! is returned as a typed status and never takes the connection down. On
//! Closing in-flight requests are drained, then every open stream handle is
//! dropped; Closed is terminal.
//!
//! Requests are dispatched on their own tasks, so callers that pipeline
//! requests may see responses complete out of issue order.

use crate::driver::DriverNode;
use crate::error::BenchError;
use crate::protocol::{
    read_frame, write_frame, CallBody, Frame, OpenStreamBody, Operation, Request, Response,
    Status, StreamOpened,
};
use crate::report::build_report;
use crate::router::{bridge, Router};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-connection lifecycle. Operations are only dispatched in `Serving`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Serving,
    Closing,
    Closed,
}

/// Outbound queue depth per connection. Bounded so tunnel producers are
/// throttled by the connection instead of buffering without limit.
const WRITE_QUEUE: usize = 64;

/// Serve the exporter RPC surface over an established channel until the
/// channel closes or `shutdown` flips to true.
pub async fn serve_connection<C>(
    channel: C,
    root: Arc<DriverNode>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BenchError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    // The session may already be cancelled by the time this connection runs.
    if *shutdown.borrow_and_update() {
        return Ok(());
    }

    let mut state = ConnectionState::Connected;
    let (read_half, mut write_half) = tokio::io::split(channel);
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(WRITE_QUEUE);
    let router = Router::new(frame_tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    state = transition(state, ConnectionState::Serving);
    let mut reader = read_half;
    let mut requests = tokio::task::JoinSet::new();

    let result = loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(Frame::Request(request)) => {
                    let root = Arc::clone(&root);
                    let router = router.clone();
                    let frame_tx = frame_tx.clone();
                    requests.spawn(async move {
                        let response = handle_request(&root, &router, request).await;
                        // Send failure means the connection is going down;
                        // the response is moot.
                        let _ = frame_tx.send(Frame::Response(response)).await;
                    });
                }
                Ok(Frame::Stream(stream_frame)) => {
                    router.dispatch(stream_frame).await;
                }
                Ok(Frame::Response(resp)) => {
                    warn!(request_id = resp.request_id, "unexpected response frame from client");
                }
                Err(BenchError::ConnectionClosed) => {
                    info!("client disconnected");
                    break Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "connection failed");
                    break Err(e);
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("session cancelled, closing connection");
                    break Ok(());
                }
            }
        }
    };

    state = transition(state, ConnectionState::Closing);
    // In-flight calls finish before the streams and the writer go away, so
    // a closing session never yanks a driver out from under a live call.
    while requests.join_next().await.is_some() {}
    router.close_all().await;
    drop(frame_tx);
    let _ = writer.await;
    transition(state, ConnectionState::Closed);

    result
}

fn transition(from: ConnectionState, to: ConnectionState) -> ConnectionState {
    debug!(?from, ?to, "connection state");
    to
}

async fn handle_request(root: &DriverNode, router: &Router, request: Request) -> Response {
    match request.operation {
        Operation::Report => {
            let records = build_report(root);
            match serde_json::to_vec(&records) {
                Ok(payload) => Response::ok(request.request_id, payload),
                Err(e) => Response::error(
                    request.request_id,
                    Status::Internal,
                    format!("failed to encode report: {e}"),
                ),
            }
        }
        Operation::Call => handle_call(root, request).await,
        Operation::OpenStream => handle_open_stream(root, router, request).await,
        Operation::LeaseRequest | Operation::LeaseList | Operation::LeaseRelease => {
            Response::error(
                request.request_id,
                Status::InvalidRequest,
                "exporter does not serve lease operations",
            )
        }
    }
}

async fn handle_call(root: &DriverNode, request: Request) -> Response {
    let device = match Uuid::parse_str(&request.identity) {
        Ok(uuid) => uuid,
        Err(_) => {
            return Response::error(
                request.request_id,
                Status::InvalidRequest,
                format!("invalid device identity: {}", request.identity),
            )
        }
    };

    let body: CallBody = match serde_json::from_slice(&request.payload) {
        Ok(body) => body,
        Err(e) => {
            return Response::error(
                request.request_id,
                Status::InvalidRequest,
                format!("malformed call body: {e}"),
            )
        }
    };

    let Some(node) = root.find(device) else {
        return Response::error(
            request.request_id,
            Status::UnknownDevice,
            request.identity.clone(),
        );
    };

    match node.driver.call(&body.method, body.args).await {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(payload) => Response::ok(request.request_id, payload),
            Err(e) => Response::error(
                request.request_id,
                Status::Internal,
                format!("failed to encode result: {e}"),
            ),
        },
        Err(e) => {
            warn!(device = %device, method = %body.method, error = %e, "driver call failed");
            Response::error(request.request_id, Status::DriverError, e.to_string())
        }
    }
}

async fn handle_open_stream(root: &DriverNode, router: &Router, request: Request) -> Response {
    let device = match Uuid::parse_str(&request.identity) {
        Ok(uuid) => uuid,
        Err(_) => {
            return Response::error(
                request.request_id,
                Status::InvalidRequest,
                format!("invalid device identity: {}", request.identity),
            )
        }
    };

    let body: OpenStreamBody = match serde_json::from_slice(&request.payload) {
        Ok(body) => body,
        Err(e) => {
            return Response::error(
                request.request_id,
                Status::InvalidRequest,
                format!("malformed open-stream body: {e}"),
            )
        }
    };

    let Some(node) = root.find(device) else {
        return Response::error(
            request.request_id,
            Status::UnknownDevice,
            request.identity.clone(),
        );
    };

    if !node.driver.stream_names().contains(&body.stream.as_str()) {
        return Response::error(request.request_id, Status::UnknownStream, body.stream);
    }

    let pipe = match node.driver.open_stream(&body.stream).await {
        Ok(pipe) => pipe,
        Err(e) => {
            return Response::error(request.request_id, Status::DriverError, e.to_string());
        }
    };

    let stream_id = router.allocate_id();
    let handle = router.register(stream_id).await;
    debug!(device = %device, stream = %body.stream, stream_id, "stream opened");

    tokio::spawn(async move {
        if let Err(e) = bridge(handle, pipe.reader, pipe.writer).await {
            debug!(stream_id, error = %e, "stream bridge ended");
        }
    });

    match serde_json::to_vec(&StreamOpened { stream_id }) {
        Ok(payload) => Response::ok(request.request_id, payload),
        Err(e) => Response::error(
            request.request_id,
            Status::Internal,
            format!("failed to encode stream id: {e}"),
        ),
    }
}
