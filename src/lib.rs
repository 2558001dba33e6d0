//! VPN Bypass - keep selected traffic off an active VPN
//!
//! While a VPN is up, this crate installs host and network routes that send
//! chosen domains, address ranges and bundled services through the local
//! gateway instead of the tunnel. Work is split across two processes:
//!
//! - the unprivileged orchestrator (`vpn-bypass`) watches the network, plans
//!   the routes and reconciles them
//! - the privileged helper (`vpn-bypass-helper`) runs as root and performs
//!   the route, hosts-file and DNS-cache operations it is asked for over a
//!   local socket
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `services`: Built-in service catalog
//! - `network`: VPN and gateway detection, network observer
//! - `platform`: Per-OS routing, inspection and cache flushing (macOS, Linux)
//! - `vpn`: Route identities, DNS resolution, planning, hosts block
//! - `rpc`: Helper wire protocol, client and server
//! - `executor`: Validated privileged operations
//! - `reconciler`: Diff-and-apply engine and activity log
//! - `state`: Route journal for crash recovery

#[cfg(not(unix))]
compile_error!("vpn-bypass supports macOS and Linux only");

pub mod backoff;
pub mod config;
pub mod executor;
pub mod network;
pub mod platform;
pub mod reconciler;
pub mod rpc;
pub mod services;
pub mod state;
pub mod vpn;

pub use config::{Configuration, DaemonSettings, TomlConfigStore};
pub use reconciler::{Reconciler, ReconcilerOptions};
pub use state::RouteJournal;
