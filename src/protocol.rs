//! Wire protocol for the exporter and controller services.
//!
//! Every message travels as a length-prefixed frame (u32 LE length, then the
//! frame body) over an already-established bidirectional channel. Three frame
//! kinds share one connection:
//!
//! - `Request`: operation kind, request id, device/lease identity where
//!   applicable, and an opaque payload (serde_json documents for structured
//!   bodies).
//! - `Response`: request id, status, opaque payload, error message.
//! - `StreamFrame`: stream id, flag (Data | HalfClose | Close | Error) and an
//!   opaque byte payload. Stream frames are the tunneling layer's unit; the
//!   transport never inspects their payload.
//!
//! The encoding is fixed for interoperability; all integers are little
//! endian, strings and payloads are u32-length-prefixed byte runs.

use crate::error::{BenchError, BenchResult};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body. Larger frames indicate a corrupt or
/// hostile peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;
const KIND_STREAM: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Report = 0,
    Call = 1,
    OpenStream = 2,
    LeaseRequest = 3,
    LeaseList = 4,
    LeaseRelease = 5,
}

impl Operation {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Operation::Report),
            1 => Some(Operation::Call),
            2 => Some(Operation::OpenStream),
            3 => Some(Operation::LeaseRequest),
            4 => Some(Operation::LeaseList),
            5 => Some(Operation::LeaseRelease),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    UnknownDevice = 1,
    UnknownStream = 2,
    DriverError = 3,
    NoMatch = 4,
    LeaseNotFound = 5,
    NotOwned = 6,
    InvalidRequest = 7,
    Internal = 8,
}

impl Status {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Status::Ok),
            1 => Some(Status::UnknownDevice),
            2 => Some(Status::UnknownStream),
            3 => Some(Status::DriverError),
            4 => Some(Status::NoMatch),
            5 => Some(Status::LeaseNotFound),
            6 => Some(Status::NotOwned),
            7 => Some(Status::InvalidRequest),
            8 => Some(Status::Internal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamFlag {
    Data = 0,
    HalfClose = 1,
    Close = 2,
    Error = 3,
}

impl StreamFlag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StreamFlag::Data),
            1 => Some(StreamFlag::HalfClose),
            2 => Some(StreamFlag::Close),
            3 => Some(StreamFlag::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u32,
    pub operation: Operation,
    /// Device uuid for Call/OpenStream, lease id for LeaseRelease, empty
    /// otherwise.
    pub identity: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: u32,
    pub status: Status,
    pub payload: Vec<u8>,
    pub error_message: String,
}

impl Response {
    pub fn ok(request_id: u32, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            status: Status::Ok,
            payload,
            error_message: String::new(),
        }
    }

    pub fn error(request_id: u32, status: Status, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status,
            payload: Vec::new(),
            error_message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub flag: StreamFlag,
    pub payload: Bytes,
}

impl StreamFrame {
    pub fn data(stream_id: u64, payload: Bytes) -> Self {
        Self {
            stream_id,
            flag: StreamFlag::Data,
            payload,
        }
    }

    pub fn control(stream_id: u64, flag: StreamFlag) -> Self {
        Self {
            stream_id,
            flag,
            payload: Bytes::new(),
        }
    }
}

/// Structured payload of a `Call` request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CallBody {
    pub method: String,
    pub args: serde_json::Value,
}

/// Structured payload of an `OpenStream` request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OpenStreamBody {
    pub stream: String,
}

/// Structured payload of a successful `OpenStream` response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StreamOpened {
    pub stream_id: u64,
}

/// One decoded frame of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Stream(StreamFrame),
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn take_u32(data: &[u8], at: usize) -> Result<u32, String> {
    let end = at + 4;
    if data.len() < end {
        return Err("truncated frame".to_string());
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[at..end]);
    Ok(u32::from_le_bytes(raw))
}

fn take_u64(data: &[u8], at: usize) -> Result<u64, String> {
    let end = at + 8;
    if data.len() < end {
        return Err("truncated frame".to_string());
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..end]);
    Ok(u64::from_le_bytes(raw))
}

fn take_bytes(data: &[u8], at: usize) -> Result<(Vec<u8>, usize), String> {
    let len = take_u32(data, at)? as usize;
    let start = at + 4;
    let end = start + len;
    if data.len() < end {
        return Err("length field exceeds frame".to_string());
    }
    Ok((data[start..end].to_vec(), end))
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            Frame::Request(req) => {
                buf.push(KIND_REQUEST);
                buf.push(req.operation as u8);
                buf.extend_from_slice(&req.request_id.to_le_bytes());
                put_bytes(&mut buf, req.identity.as_bytes());
                put_bytes(&mut buf, &req.payload);
            }
            Frame::Response(resp) => {
                buf.push(KIND_RESPONSE);
                buf.push(resp.status as u8);
                buf.extend_from_slice(&resp.request_id.to_le_bytes());
                put_bytes(&mut buf, &resp.payload);
                put_bytes(&mut buf, resp.error_message.as_bytes());
            }
            Frame::Stream(frame) => {
                buf.push(KIND_STREAM);
                buf.push(frame.flag as u8);
                buf.extend_from_slice(&frame.stream_id.to_le_bytes());
                put_bytes(&mut buf, &frame.payload);
            }
        }

        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, String> {
        if data.len() < 2 {
            return Err("frame too short".to_string());
        }

        match data[0] {
            KIND_REQUEST => {
                let operation =
                    Operation::from_u8(data[1]).ok_or_else(|| "invalid operation".to_string())?;
                let request_id = take_u32(data, 2)?;
                let (identity, next) = take_bytes(data, 6)?;
                let identity = String::from_utf8(identity).map_err(|e| e.to_string())?;
                let (payload, _) = take_bytes(data, next)?;
                Ok(Frame::Request(Request {
                    request_id,
                    operation,
                    identity,
                    payload,
                }))
            }
            KIND_RESPONSE => {
                let status =
                    Status::from_u8(data[1]).ok_or_else(|| "invalid status".to_string())?;
                let request_id = take_u32(data, 2)?;
                let (payload, next) = take_bytes(data, 6)?;
                let (error_message, _) = take_bytes(data, next)?;
                let error_message =
                    String::from_utf8(error_message).map_err(|e| e.to_string())?;
                Ok(Frame::Response(Response {
                    request_id,
                    status,
                    payload,
                    error_message,
                }))
            }
            KIND_STREAM => {
                let flag =
                    StreamFlag::from_u8(data[1]).ok_or_else(|| "invalid stream flag".to_string())?;
                let stream_id = take_u64(data, 2)?;
                let (payload, _) = take_bytes(data, 10)?;
                Ok(Frame::Stream(StreamFrame {
                    stream_id,
                    flag,
                    payload: Bytes::from(payload),
                }))
            }
            other => Err(format!("unknown frame kind: {other}")),
        }
    }
}

/// Read one length-prefixed frame. Returns `ConnectionClosed` on clean EOF at
/// a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> BenchResult<Frame> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(BenchError::ConnectionClosed)
        }
        Err(e) => return Err(BenchError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BenchError::Protocol(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            BenchError::ConnectionClosed
        } else {
            BenchError::Io(e)
        }
    })?;

    Frame::decode(&body).map_err(BenchError::Protocol)
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> BenchResult<()> {
    let body = frame.encode();
    writer
        .write_all(&(body.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = Request {
            request_id: 42,
            operation: Operation::Call,
            identity: "b9d3e2a0".to_string(),
            payload: vec![1, 2, 3, 4],
        };
        let encoded = Frame::Request(req.clone()).encode();
        let decoded = Frame::decode(&encoded).unwrap();

        assert_eq!(decoded, Frame::Request(req));
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = Response::error(7, Status::DriverError, "relay stuck");
        let encoded = Frame::Response(resp.clone()).encode();
        let decoded = Frame::decode(&encoded).unwrap();

        assert_eq!(decoded, Frame::Response(resp));
    }

    #[test]
    fn test_stream_frame_roundtrip() {
        let frame = StreamFrame::data(9001, Bytes::from_static(b"console output"));
        let encoded = Frame::Stream(frame.clone()).encode();
        let decoded = Frame::decode(&encoded).unwrap();

        assert_eq!(decoded, Frame::Stream(frame));
    }

    #[test]
    fn test_empty_identity_and_payload() {
        let req = Request {
            request_id: 0,
            operation: Operation::Report,
            identity: String::new(),
            payload: Vec::new(),
        };
        let decoded = Frame::decode(&Frame::Request(req.clone()).encode()).unwrap();
        assert_eq!(decoded, Frame::Request(req));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let encoded = Frame::Request(Request {
            request_id: 1,
            operation: Operation::OpenStream,
            identity: "dev".to_string(),
            payload: vec![0; 32],
        })
        .encode();

        assert!(Frame::decode(&encoded[..encoded.len() - 8]).is_err());
        assert!(Frame::decode(&encoded[..3]).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Frame::decode(&[9, 0, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_framing_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::Stream(StreamFrame::control(3, StreamFlag::HalfClose));

        write_frame(&mut a, &frame).await.unwrap();
        let decoded = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded, frame);

        drop(a);
        match read_frame(&mut b).await {
            Err(crate::error::BenchError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }
}
