//! Wire protocol between orchestrator and helper
//!
//! Newline-delimited JSON over a Unix domain socket, one request in flight
//! per connection:
//!
//! ```text
//! {"id":1,"request":{"method":"addRoute","params":{"destination":"93.184.216.34","gateway":"192.168.1.1","isNetwork":false}}}
//! {"id":1,"reply":{"kind":"status","success":true,"error":null}}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version reported by `getVersion`; the orchestrator refuses to drive a
/// helper reporting anything else.
pub const HELPER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame exceeds {MAX_FRAME_BYTES} bytes")]
    TooLarge,
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Hosts entry as it travels over the wire; validated by the helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsRecord {
    pub domain: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    AddRoute {
        destination: String,
        gateway: String,
        is_network: bool,
    },
    RemoveRoute {
        destination: String,
    },
    UpdateHostsFile {
        entries: Vec<HostsRecord>,
    },
    #[serde(rename = "flushDNSCache")]
    FlushDnsCache,
    GetVersion,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::AddRoute { .. } => "addRoute",
            Request::RemoveRoute { .. } => "removeRoute",
            Request::UpdateHostsFile { .. } => "updateHostsFile",
            Request::FlushDnsCache => "flushDNSCache",
            Request::GetVersion => "getVersion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Reply {
    /// Outcome of addRoute / removeRoute / updateHostsFile
    Status {
        success: bool,
        error: Option<String>,
    },
    Flushed {
        success: bool,
    },
    Version {
        version: String,
    },
    /// The request failed validation and was not executed
    Rejected {
        reason: String,
    },
    /// The peer is not authorized to talk to the helper
    Denied {
        reason: String,
    },
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Reply::Status {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    pub reply: Reply,
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let limit = (MAX_FRAME_BYTES + 1) as u64;
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge);
        }
        return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(Some(serde_json::from_slice(&buf)?))
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(frame)?;
    if bytes.len() >= MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge);
    }
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
