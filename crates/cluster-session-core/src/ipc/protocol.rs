//! Session wire protocol and framing.
//!
//! Every message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON encoding of a [`Request`] or [`Response`].
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! A connection may carry many outstanding requests, and the coordinator may
//! answer them in any order. Responses are matched to requests by
//! `requestId` only. Field names on the wire are camelCase.

use crate::config::IpcConfig;
use crate::error::Unavailable;
use crate::{Result, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// The operation a request asks the coordinator to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    Get {
        session_id: String,
    },
    Set {
        session_id: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    Destroy {
        session_id: String,
    },
    Touch {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    Length,
    Clear,
    Ping,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Get { .. } => "get",
            Operation::Set { .. } => "set",
            Operation::Destroy { .. } => "destroy",
            Operation::Touch { .. } => "touch",
            Operation::Length => "length",
            Operation::Clear => "clear",
            Operation::Ping => "ping",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Operation::Get { session_id }
            | Operation::Set { session_id, .. }
            | Operation::Destroy { session_id }
            | Operation::Touch { session_id, .. } => Some(session_id),
            Operation::Length | Operation::Clear | Operation::Ping => None,
        }
    }
}

/// A request sent from a peer to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation id, unique per connection.
    pub request_id: u64,
    #[serde(flatten)]
    pub operation: Operation,
}

impl Request {
    pub fn new(request_id: u64, operation: Operation) -> Self {
        Self {
            request_id,
            operation,
        }
    }
}

/// Outcome class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Ok,
    NotFound,
    Error,
}

/// A response sent from the coordinator back to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok(request_id: u64, payload: Option<Value>) -> Self {
        Self {
            request_id,
            status: Status::Ok,
            payload,
            message: None,
        }
    }

    pub fn not_found(request_id: u64) -> Self {
        Self {
            request_id,
            status: Status::NotFound,
            payload: None,
            message: None,
        }
    }

    pub fn error(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: Status::Error,
            payload: None,
            message: Some(message.into()),
        }
    }
}

pub(crate) fn ttl_to_ms(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

pub(crate) fn ttl_from_ms(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

/// Encode a message as JSON bytes ready for [`write_frame`].
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a frame payload. Any failure is a protocol error.
pub fn decode<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame)
        .map_err(|e| SessionError::Unavailable(Unavailable::Protocol(format!("undecodable frame: {}", e))))
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF at a frame boundary. EOF inside a frame and
/// headers announcing more than [`IpcConfig::MAX_IPC_MESSAGE_SIZE`] bytes are
/// protocol errors.
///
/// Not cancel safe: a partially read frame is lost if the future is dropped.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SessionError::Unavailable(Unavailable::Protocol(format!(
                "stream ended inside a frame header ({} of 4 bytes)",
                filled
            ))));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_IPC_MESSAGE_SIZE {
        return Err(SessionError::Unavailable(Unavailable::Protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            IpcConfig::MAX_IPC_MESSAGE_SIZE
        ))));
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SessionError::Unavailable(
            Unavailable::Protocol(format!("stream ended inside a {} byte frame", len)),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_IPC_MESSAGE_SIZE {
        return Err(SessionError::Unavailable(Unavailable::Protocol(format!(
            "refusing to send {} byte frame, maximum is {}",
            payload.len(),
            IpcConfig::MAX_IPC_MESSAGE_SIZE
        ))));
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
