//! Orchestrator side of the RPC channel
//!
//! Keeps one connection to the helper, opened lazily and reopened after a
//! failure. Every call is bounded by the configured timeout.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::protocol::{self, FrameError, HostsRecord, Reply, ReplyFrame, Request, RequestFrame};
use super::{PrivilegedOps, RpcError};
use crate::vpn::hosts::HostsEntry;
use crate::vpn::route::RouteTarget;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn exchange(&mut self, frame: &RequestFrame) -> Result<ReplyFrame, FrameError> {
        protocol::write_frame(&mut self.writer, frame).await?;
        protocol::read_frame(&mut self.reader)
            .await?
            .ok_or_else(|| FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()))
    }
}

/// Client side of the helper socket
///
/// Holds one persistent connection and reconnects lazily after any
/// transport error. Every call is bounded by the configured timeout; a
/// call that times out surfaces as [`RpcError::Unreachable`] and drops the
/// connection, since a late reply would otherwise be read by the next call.
pub struct HelperClient {
    socket_path: PathBuf,
    timeout: Duration,
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl HelperClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self) -> Result<Connection, RpcError> {
        let stream = match timeout(self.timeout, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RpcError::Unreachable(format!(
                    "{}: {}",
                    self.socket_path.display(),
                    e
                )));
            }
            Err(_) => {
                return Err(RpcError::Unreachable(format!(
                    "{}: connect timed out",
                    self.socket_path.display()
                )));
            }
        };
        debug!("Connected to helper at {}", self.socket_path.display());
        let (read, writer) = stream.into_split();
        Ok(Connection {
            reader: BufReader::new(read),
            writer,
        })
    }

    async fn call(&self, request: Request) -> Result<Reply, RpcError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(RpcError::Unreachable("connection lost".to_string()));
        };

        let method = request.method();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame { id, request };

        let reply = match timeout(self.timeout, conn.exchange(&frame)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(FrameError::Malformed(e))) => {
                *guard = None;
                return Err(RpcError::Protocol(format!("{}: {}", method, e)));
            }
            Ok(Err(e)) => {
                *guard = None;
                return Err(RpcError::Unreachable(format!("{}: {}", method, e)));
            }
            Err(_) => {
                *guard = None;
                warn!("{} timed out after {:?}", method, self.timeout);
                return Err(RpcError::Unreachable(format!("{} timed out", method)));
            }
        };

        if reply.id != id {
            *guard = None;
            return Err(RpcError::Protocol(format!(
                "{}: reply id {} does not match request id {}",
                method, reply.id, id
            )));
        }
        if let Reply::Denied { reason } = reply.reply {
            // The helper closes the connection after denying
            *guard = None;
            return Err(RpcError::PrivilegeDenied(reason));
        }
        Ok(reply.reply)
    }
}

fn expect_status(reply: Reply) -> Result<(), RpcError> {
    match reply {
        Reply::Status { success: true, .. } => Ok(()),
        Reply::Status { success: false, error } => Err(RpcError::Failed(
            error.unwrap_or_else(|| "unknown error".to_string()),
        )),
        Reply::Rejected { reason } => Err(RpcError::Rejected(reason)),
        other => Err(RpcError::Protocol(format!("unexpected reply: {:?}", other))),
    }
}

#[async_trait]
impl PrivilegedOps for HelperClient {
    async fn ensure_connected(&self) -> Result<(), RpcError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        Ok(())
    }

    async fn add_route(&self, target: &RouteTarget, gateway: IpAddr) -> Result<(), RpcError> {
        let reply = self
            .call(Request::AddRoute {
                destination: target.wire_destination(),
                gateway: gateway.to_string(),
                is_network: target.is_network(),
            })
            .await?;
        expect_status(reply)
    }

    async fn remove_route(&self, target: &RouteTarget) -> Result<(), RpcError> {
        let reply = self
            .call(Request::RemoveRoute {
                destination: target.wire_destination(),
            })
            .await?;
        expect_status(reply)
    }

    async fn update_hosts_file(&self, entries: &[HostsEntry]) -> Result<(), RpcError> {
        let entries = entries
            .iter()
            .map(|e| HostsRecord {
                domain: e.domain.clone(),
                ip: e.ip.to_string(),
            })
            .collect();
        let reply = self.call(Request::UpdateHostsFile { entries }).await?;
        expect_status(reply)
    }

    async fn flush_dns_cache(&self) -> Result<bool, RpcError> {
        match self.call(Request::FlushDnsCache).await? {
            Reply::Flushed { success } => Ok(success),
            other => Err(RpcError::Protocol(format!("unexpected reply: {:?}", other))),
        }
    }

    async fn version(&self) -> Result<String, RpcError> {
        match self.call(Request::GetVersion).await? {
            Reply::Version { version } => Ok(version),
            other => Err(RpcError::Protocol(format!("unexpected reply: {:?}", other))),
        }
    }
}
