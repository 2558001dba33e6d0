//! Platform-specific implementations
//!
//! Three concerns live here, each behind a small trait so the rest of the
//! crate never shells out directly:
//!
//! - [`RoutingManager`]: the OS routing primitive (executor only)
//! - [`NetworkInspector`]: interface and default-route inspection
//! - [`CacheFlusher`]: resolver cache flushing, tried in priority order

#[cfg(unix)]
pub mod linux;

#[cfg(unix)]
pub mod mac;

use crate::network::{self, DefaultRoute, InterfaceInfo, NetworkSnapshot};
use crate::vpn::route::RouteTarget;
use std::net::IpAddr;
use std::process::{Command, Output};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to add route: {0}")]
    AddRouteError(String),
    #[error("Failed to delete route: {0}")]
    DeleteRouteError(String),
    #[error("Failed to inspect network state: {0}")]
    InspectError(String),
    #[error("Failed to flush DNS cache: {0}")]
    FlushError(String),
    #[error("Failed to run {program}: {source}")]
    CommandError {
        program: String,
        source: std::io::Error,
    },
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Platform-agnostic routing interface
pub trait RoutingManager: Send + Sync {
    /// Install a route to `target` via `gateway`. An identical existing
    /// route counts as success.
    fn add_route(&self, target: &RouteTarget, gateway: IpAddr) -> Result<(), PlatformError>;
    /// Remove the route to `target`. An absent route counts as success.
    fn delete_route(&self, target: &RouteTarget) -> Result<(), PlatformError>;
}

/// Read-only view of interfaces and default routes
pub trait NetworkInspector: Send + Sync {
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, PlatformError>;
    fn default_routes(&self) -> Result<Vec<DefaultRoute>, PlatformError>;

    /// Current snapshot. Inspection errors degrade to "no data" rather than
    /// failing, so a broken check reads as disconnected.
    fn snapshot(&self) -> NetworkSnapshot {
        let interfaces = self.interfaces().unwrap_or_else(|e| {
            warn!("Interface inspection failed: {}", e);
            Vec::new()
        });
        let routes = self.default_routes().unwrap_or_else(|e| {
            warn!("Route table inspection failed: {}", e);
            Vec::new()
        });
        network::detect(&interfaces, &routes)
    }
}

/// One way of flushing the system resolver cache
pub trait CacheFlusher: Send + Sync {
    fn name(&self) -> &str;
    fn flush(&self) -> Result<(), PlatformError>;
}

/// Flusher that runs a single command
pub struct CommandFlusher {
    program: &'static str,
    args: &'static [&'static str],
}

impl CommandFlusher {
    pub const fn new(program: &'static str, args: &'static [&'static str]) -> Self {
        Self { program, args }
    }
}

impl CacheFlusher for CommandFlusher {
    fn name(&self) -> &str {
        self.program
    }

    fn flush(&self) -> Result<(), PlatformError> {
        let output = run(self.program, self.args)?;
        if !output.status.success() {
            return Err(PlatformError::FlushError(stderr_of(&output)));
        }
        Ok(())
    }
}

/// Flushers tried in fixed priority order; the first success wins
pub struct FlushChain {
    flushers: Vec<Box<dyn CacheFlusher>>,
}

impl FlushChain {
    pub fn new(flushers: Vec<Box<dyn CacheFlusher>>) -> Self {
        Self { flushers }
    }

    pub fn flush(&self) -> Result<(), PlatformError> {
        let mut last_error = PlatformError::UnsupportedPlatform;
        for flusher in &self.flushers {
            match flusher.flush() {
                Ok(()) => {
                    debug!("DNS cache flushed via {}", flusher.name());
                    return Ok(());
                }
                Err(e) => {
                    debug!("DNS flush via {} failed: {}", flusher.name(), e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Run a command to completion, capturing output
pub(crate) fn run(program: &str, args: &[&str]) -> Result<Output, PlatformError> {
    debug!("Running {} {}", program, args.join(" "));
    Command::new(program)
        .args(args)
        .output()
        .map_err(|source| PlatformError::CommandError {
            program: program.to_string(),
            source,
        })
}

pub(crate) fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Get the appropriate routing manager for the current platform
pub fn get_routing_manager() -> Result<Box<dyn RoutingManager>, PlatformError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(mac::MacRoutingManager::new()))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxRoutingManager::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Get the network inspector for the current platform
pub fn get_network_inspector() -> Result<Box<dyn NetworkInspector>, PlatformError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(mac::MacNetworkInspector::new()))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxNetworkInspector::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Resolver cache flushers for the current platform, in priority order
pub fn get_cache_flusher() -> FlushChain {
    #[cfg(target_os = "macos")]
    {
        mac::cache_flusher()
    }

    #[cfg(target_os = "linux")]
    {
        linux::cache_flusher()
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        FlushChain::new(Vec::new())
    }
}

/// Long-running command that prints a line per interface/route change
pub fn change_monitor_command() -> Option<(&'static str, &'static [&'static str])> {
    #[cfg(target_os = "macos")]
    {
        Some(mac::MONITOR_COMMAND)
    }

    #[cfg(target_os = "linux")]
    {
        Some(linux::MONITOR_COMMAND)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingFlusher {
        calls: Arc<AtomicUsize>,
        succeed: bool,
    }

    impl CacheFlusher for CountingFlusher {
        fn name(&self) -> &str {
            "counting"
        }

        fn flush(&self) -> Result<(), PlatformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(())
            } else {
                Err(PlatformError::FlushError("nope".into()))
            }
        }
    }

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::AddRouteError("test error".to_string());
        assert_eq!(err.to_string(), "Failed to add route: test error");

        let err = PlatformError::DeleteRouteError("delete failed".to_string());
        assert_eq!(err.to_string(), "Failed to delete route: delete failed");

        let err = PlatformError::UnsupportedPlatform;
        assert_eq!(err.to_string(), "Unsupported platform");
    }

    #[test]
    fn test_flush_chain_falls_back_in_order() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let chain = FlushChain::new(vec![
            Box::new(CountingFlusher { calls: first.clone(), succeed: false }),
            Box::new(CountingFlusher { calls: second.clone(), succeed: true }),
            Box::new(CountingFlusher { calls: third.clone(), succeed: true }),
        ]);

        assert!(chain.flush().is_ok());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_flush_chain_all_fail() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = FlushChain::new(vec![Box::new(CountingFlusher {
            calls: calls.clone(),
            succeed: false,
        })]);
        assert!(matches!(chain.flush(), Err(PlatformError::FlushError(_))));
        assert!(FlushChain::new(Vec::new()).flush().is_err());
    }

    #[test]
    fn test_missing_program_is_command_error() {
        let flusher = CommandFlusher::new("definitely-not-a-real-binary-xyz", &[]);
        assert!(matches!(
            flusher.flush(),
            Err(PlatformError::CommandError { .. })
        ));
    }

    #[test]
    fn test_get_routing_manager_returns_ok() {
        #[cfg(any(target_os = "macos", target_os = "linux"))]
        {
            assert!(get_routing_manager().is_ok());
            assert!(get_network_inspector().is_ok());
            assert!(change_monitor_command().is_some());
        }
    }
}
