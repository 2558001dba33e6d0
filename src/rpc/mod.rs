//! RPC channel between the unprivileged orchestrator and the privileged helper

pub mod client;
pub mod protocol;
pub mod server;

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::vpn::hosts::HostsEntry;
use crate::vpn::route::RouteTarget;

pub use client::HelperClient;
pub use protocol::{HELPER_VERSION, Reply, Request};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Helper unreachable: {0}")]
    Unreachable(String),
    #[error("Helper refused connection: {0}")]
    PrivilegeDenied(String),
    #[error("Helper rejected request: {0}")]
    Rejected(String),
    #[error("Helper operation failed: {0}")]
    Failed(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// Whether the helper itself is gone, as opposed to one operation failing
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RpcError::Unreachable(_) | RpcError::PrivilegeDenied(_))
    }
}

/// Privileged operations the reconciler needs from the helper
#[async_trait]
pub trait PrivilegedOps: Send + Sync {
    /// Make sure a connection to the helper exists, connecting if needed
    async fn ensure_connected(&self) -> Result<(), RpcError>;

    async fn add_route(&self, target: &RouteTarget, gateway: IpAddr) -> Result<(), RpcError>;

    async fn remove_route(&self, target: &RouteTarget) -> Result<(), RpcError>;

    /// Replace the managed hosts block; an empty slice removes it
    async fn update_hosts_file(&self, entries: &[HostsEntry]) -> Result<(), RpcError>;

    /// Returns `Ok(false)` when every flush strategy failed
    async fn flush_dns_cache(&self) -> Result<bool, RpcError>;

    async fn version(&self) -> Result<String, RpcError>;
}
