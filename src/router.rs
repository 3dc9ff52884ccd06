//! Stream multiplexer: carries N independent duplex byte pipes over one
//! logical connection.
//!
//! Each pipe is addressed by an opaque stream id issued by the side that
//! opened it (the exporter, for streams opened via `OpenStream`). Payloads
//! are never inspected. Frames carry Data, HalfClose, Close or Error flags;
//! closing the owning connection closes every handle.
//!
//! Backpressure: every direction of every tunnel is a copy loop that awaits
//! its slower side, so a slow consumer throttles its producer. Inbound data
//! is staged in a bounded per-stream buffer ([`STREAM_BUFFER`] frames). The
//! shared connection reader never awaits a stalled consumer: a stream that
//! overruns its buffer is aborted (Error to the peer, handle unregistered)
//! while every other stream and pipelined response keeps flowing.

use crate::error::{BenchError, BenchResult};
use crate::protocol::{Frame, StreamFlag, StreamFrame};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

/// Per-stream inbound buffer, in frames.
pub const STREAM_BUFFER: usize = 256;

/// Read chunk size for tunnel copy loops.
const COPY_CHUNK: usize = 16 * 1024;

/// Inbound event delivered to a stream handle.
#[derive(Debug)]
enum StreamEvent {
    Data(Bytes),
    HalfClose,
    Error(String),
}

type StreamMap = Arc<Mutex<HashMap<u64, mpsc::Sender<StreamEvent>>>>;

/// Multiplexes stream frames for one logical connection. Exactly one router
/// exists per connection; both sides run one.
#[derive(Clone)]
pub struct Router {
    outbound: mpsc::Sender<Frame>,
    streams: StreamMap,
    next_id: Arc<AtomicU64>,
}

impl Router {
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            outbound,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Issue a fresh stream id. Only the side that opens streams calls this.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a stream id and obtain its handle.
    pub async fn register(&self, id: u64) -> StreamHandle {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.streams.lock().await.insert(id, tx);
        trace!(stream_id = id, "stream registered");
        StreamHandle {
            id,
            outbound: self.outbound.clone(),
            inbound: rx,
            streams: Arc::clone(&self.streams),
            closed: false,
        }
    }

    /// Route one inbound stream frame to its handle. Frames for unknown ids
    /// are dropped: the handle may already have closed locally.
    ///
    /// Runs on the shared connection reader, so it must never await a stream
    /// handle's buffer. A handle whose buffer is full has stalled past its
    /// allowance and is aborted; the other streams keep flowing.
    pub async fn dispatch(&self, frame: StreamFrame) {
        let sender = { self.streams.lock().await.get(&frame.stream_id).cloned() };

        let Some(sender) = sender else {
            trace!(stream_id = frame.stream_id, "frame for unknown stream dropped");
            return;
        };

        match frame.flag {
            StreamFlag::Data => match sender.try_send(StreamEvent::Data(frame.payload)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.streams.lock().await.remove(&frame.stream_id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        stream_id = frame.stream_id,
                        "stream buffer overrun, aborting stream"
                    );
                    self.streams.lock().await.remove(&frame.stream_id);
                    // Best effort: if the writer queue is full too, the peer
                    // learns about the abort when the connection closes.
                    let _ = self.outbound.try_send(Frame::Stream(StreamFrame {
                        stream_id: frame.stream_id,
                        flag: StreamFlag::Error,
                        payload: Bytes::from_static(b"stream buffer overrun"),
                    }));
                }
            },
            StreamFlag::HalfClose => {
                // Dropping the sender ends the event stream after the
                // buffered data drains, which is what HalfClose means.
                if sender.try_send(StreamEvent::HalfClose).is_err() {
                    self.streams.lock().await.remove(&frame.stream_id);
                }
            }
            StreamFlag::Close => {
                // Dropping the sender ends the handle's event stream.
                self.streams.lock().await.remove(&frame.stream_id);
            }
            StreamFlag::Error => {
                let message = String::from_utf8_lossy(&frame.payload).into_owned();
                let _ = sender.try_send(StreamEvent::Error(message));
                self.streams.lock().await.remove(&frame.stream_id);
            }
        }
    }

    /// Number of currently registered streams.
    pub async fn active_streams(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Close every handle on this connection. Called when the connection
    /// transitions to Closing.
    pub async fn close_all(&self) {
        let mut streams = self.streams.lock().await;
        let count = streams.len();
        streams.clear();
        if count > 0 {
            debug!(count, "closed all stream handles");
        }
    }
}

/// One end of a multiplexed duplex byte pipe.
pub struct StreamHandle {
    id: u64,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<StreamEvent>,
    streams: StreamMap,
    closed: bool,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send a data frame to the peer. Awaits the shared writer queue, which
    /// is how producers are throttled.
    pub async fn send(&self, payload: Bytes) -> BenchResult<()> {
        self.outbound
            .send(Frame::Stream(StreamFrame::data(self.id, payload)))
            .await
            .map_err(|_| BenchError::ConnectionClosed)
    }

    /// Receive the next chunk. `Ok(None)` means the peer half-closed or
    /// closed; a remote error surfaces as [`BenchError::Tunnel`].
    pub async fn recv(&mut self) -> BenchResult<Option<Bytes>> {
        match self.inbound.recv().await {
            Some(StreamEvent::Data(bytes)) => Ok(Some(bytes)),
            Some(StreamEvent::HalfClose) | None => Ok(None),
            Some(StreamEvent::Error(message)) => Err(BenchError::Tunnel {
                stream_id: self.id,
                message,
            }),
        }
    }

    /// Signal that this side will send no more data.
    pub async fn half_close(&self) -> BenchResult<()> {
        self.outbound
            .send(Frame::Stream(StreamFrame::control(
                self.id,
                StreamFlag::HalfClose,
            )))
            .await
            .map_err(|_| BenchError::ConnectionClosed)
    }

    /// Report a local failure to the peer and tear the stream down.
    pub async fn abort(mut self, message: &str) {
        let _ = self
            .outbound
            .send(Frame::Stream(StreamFrame {
                stream_id: self.id,
                flag: StreamFlag::Error,
                payload: Bytes::copy_from_slice(message.as_bytes()),
            }))
            .await;
        self.unregister().await;
        self.closed = true;
    }

    /// Close the stream, notifying the peer.
    pub async fn close(mut self) {
        let _ = self
            .outbound
            .send(Frame::Stream(StreamFrame::control(
                self.id,
                StreamFlag::Close,
            )))
            .await;
        self.unregister().await;
        self.closed = true;
    }

    async fn unregister(&self) {
        self.streams.lock().await.remove(&self.id);
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !self.closed {
            // Best effort: the connection may already be gone.
            let _ = self.outbound.try_send(Frame::Stream(StreamFrame::control(
                self.id,
                StreamFlag::Close,
            )));
        }
    }
}

/// Bridge a stream handle to a local transport endpoint until either side
/// closes or errors. Local EOF half-closes the stream and the remote side is
/// drained before the handle closes; a remote error is propagated as
/// [`BenchError::Tunnel`] after the local endpoint is shut down.
pub async fn tunnel<E>(handle: StreamHandle, local: E) -> BenchResult<()>
where
    E: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(local);
    bridge(handle, reader, writer).await
}

/// Like [`tunnel`], for endpoints whose halves are already separate (e.g. a
/// driver's exported pipe).
pub async fn bridge<R, W>(mut handle: StreamHandle, mut reader: R, mut writer: W) -> BenchResult<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let stream_id = handle.id();
    let uplink_handle = UplinkHalf {
        outbound: handle.outbound.clone(),
        id: stream_id,
    };

    let uplink = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = uplink_handle.half_close().await;
                    return Ok(());
                }
                Ok(n) => {
                    if uplink_handle
                        .send(Bytes::copy_from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        return Err(BenchError::ConnectionClosed);
                    }
                }
                Err(e) => {
                    let _ = uplink_handle.error(&e.to_string()).await;
                    return Err(BenchError::Io(e));
                }
            }
        }
    });

    // Downlink runs on the current task so the handle's receiver stays here.
    let downlink_result: BenchResult<()> = loop {
        match handle.recv().await {
            Ok(Some(bytes)) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    break Err(BenchError::Tunnel {
                        stream_id,
                        message: format!("local endpoint write failed: {e}"),
                    });
                }
            }
            Ok(None) => {
                let _ = writer.shutdown().await;
                break Ok(());
            }
            Err(e) => {
                let _ = writer.shutdown().await;
                break Err(e);
            }
        }
    };

    let uplink_result = match uplink.await {
        Ok(result) => result,
        Err(join_error) => Err(BenchError::Internal(format!(
            "tunnel uplink task failed: {join_error}"
        ))),
    };

    handle.close().await;

    match (downlink_result, uplink_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), _) => {
            warn!(stream_id, error = %e, "tunnel closed with error");
            Err(e)
        }
        (Ok(()), Err(e)) => {
            warn!(stream_id, error = %e, "tunnel uplink closed with error");
            Err(e)
        }
    }
}

/// Send-only view used by the uplink task while the receiving half stays
/// with the downlink loop.
struct UplinkHalf {
    outbound: mpsc::Sender<Frame>,
    id: u64,
}

impl UplinkHalf {
    async fn send(&self, payload: Bytes) -> Result<(), ()> {
        self.outbound
            .send(Frame::Stream(StreamFrame::data(self.id, payload)))
            .await
            .map_err(|_| ())
    }

    async fn half_close(&self) -> Result<(), ()> {
        self.outbound
            .send(Frame::Stream(StreamFrame::control(
                self.id,
                StreamFlag::HalfClose,
            )))
            .await
            .map_err(|_| ())
    }

    async fn error(&self, message: &str) -> Result<(), ()> {
        self.outbound
            .send(Frame::Stream(StreamFrame {
                stream_id: self.id,
                flag: StreamFlag::Error,
                payload: Bytes::copy_from_slice(message.as_bytes()),
            }))
            .await
            .map_err(|_| ())
    }
}
