//! Connection plumbing shared by the exporter client and the lease manager.
//!
//! A [`Connection`] wraps one established channel: a writer task drains a
//! bounded frame queue, a reader task completes pending requests by id and
//! hands stream frames to the router. Requests may be pipelined; responses
//! complete whenever the peer answers, not necessarily in issue order.

use crate::error::{BenchError, BenchResult};
use crate::protocol::{read_frame, write_frame, Frame, Operation, Request, Response};
use crate::router::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outbound queue depth. Bounded so local producers feel connection
/// backpressure.
const WRITE_QUEUE: usize = 64;

/// Default per-request deadline when the caller does not specify one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct Connection {
    frame_tx: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Response>>>,
    next_id: AtomicU32,
    pub(crate) router: Router,
}

/// A live connection plus its background tasks.
pub(crate) struct ConnectionHandle {
    pub(crate) conn: Arc<Connection>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Tear the connection down, cancelling outstanding requests and
    /// closing every tunnel.
    pub(crate) async fn close(self) {
        self.reader.abort();
        self.writer.abort();
        self.conn.router.close_all().await;
    }
}

impl Connection {
    /// Spawn reader and writer tasks over an established channel.
    pub(crate) fn spawn<C>(channel: C) -> ConnectionHandle
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(channel);
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(WRITE_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if write_frame(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        let conn = Arc::new(Connection {
            router: Router::new(frame_tx.clone()),
            frame_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        });

        let reader_conn = Arc::clone(&conn);
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Frame::Response(response)) => {
                        let sender = {
                            let mut pending = reader_conn.pending.lock().await;
                            pending.remove(&response.request_id)
                        };
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => debug!(
                                request_id = response.request_id,
                                "response for unknown request dropped"
                            ),
                        }
                    }
                    Ok(Frame::Stream(frame)) => reader_conn.router.dispatch(frame).await,
                    Ok(Frame::Request(request)) => warn!(
                        request_id = request.request_id,
                        "unexpected request frame from server"
                    ),
                    Err(e) => {
                        if !matches!(e, BenchError::ConnectionClosed) {
                            warn!(error = %e, "connection reader failed");
                        }
                        break;
                    }
                }
            }
            // Dropping the senders fails every outstanding request with
            // ConnectionClosed; tunnels observe close_all.
            reader_conn.pending.lock().await.clear();
            reader_conn.router.close_all().await;
        });

        ConnectionHandle {
            conn,
            reader,
            writer,
        }
    }

    /// Issue one request and await its response, bounded by `timeout`.
    pub(crate) async fn request(
        &self,
        operation: Operation,
        identity: String,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> BenchResult<Response> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let frame = Frame::Request(Request {
            request_id,
            operation,
            identity,
            payload,
        });
        if self.frame_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(BenchError::ConnectionClosed);
        }

        let deadline = timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: reader task ended, connection is gone.
            Ok(Err(_)) => Err(BenchError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(BenchError::TimedOut(deadline))
            }
        }
    }
}
