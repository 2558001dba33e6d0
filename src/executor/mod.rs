//! Privileged executor
//!
//! Runs inside the helper as root. Performs exactly the five operations of
//! the wire protocol, one at a time, after validating every argument.

pub mod validate;

use std::sync::Mutex;

use tracing::{info, warn};

use crate::platform::{FlushChain, RoutingManager};
use crate::rpc::protocol::{HELPER_VERSION, Reply, Request};
use crate::rpc::server::RequestHandler;
use crate::vpn::hosts::HostsManager;

pub use validate::ValidationError;

pub struct Executor {
    routes: Box<dyn RoutingManager>,
    hosts: HostsManager,
    flusher: FlushChain,
    // Serializes operations and numbers them for the log
    sequence: Mutex<u64>,
}

impl Executor {
    pub fn new(routes: Box<dyn RoutingManager>, hosts: HostsManager, flusher: FlushChain) -> Self {
        Self {
            routes,
            hosts,
            flusher,
            sequence: Mutex::new(0),
        }
    }

    pub fn execute(&self, request: Request) -> Reply {
        let mut sequence = self.sequence.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *sequence += 1;
        let op = *sequence;

        match request {
            Request::AddRoute {
                destination,
                gateway,
                is_network,
            } => {
                let target = match validate::route_target(&destination, is_network) {
                    Ok(target) => target,
                    Err(e) => return rejected(op, "addRoute", e),
                };
                let gateway = match validate::gateway(&gateway, &target) {
                    Ok(gateway) => gateway,
                    Err(e) => return rejected(op, "addRoute", e),
                };
                match self.routes.add_route(&target, gateway) {
                    Ok(()) => {
                        info!("[op {}] Added route {} via {}", op, target, gateway);
                        Reply::ok()
                    }
                    Err(e) => {
                        warn!("[op {}] Failed to add route {}: {}", op, target, e);
                        Reply::failed(e.to_string())
                    }
                }
            }
            Request::RemoveRoute { destination } => {
                let target = match validate::removal_target(&destination) {
                    Ok(target) => target,
                    Err(e) => return rejected(op, "removeRoute", e),
                };
                match self.routes.delete_route(&target) {
                    Ok(()) => {
                        info!("[op {}] Removed route {}", op, target);
                        Reply::ok()
                    }
                    Err(e) => {
                        warn!("[op {}] Failed to remove route {}: {}", op, target, e);
                        Reply::failed(e.to_string())
                    }
                }
            }
            Request::UpdateHostsFile { entries } => {
                let entries = match validate::hosts_entries(&entries) {
                    Ok(entries) => entries,
                    Err(e) => return rejected(op, "updateHostsFile", e),
                };
                let result = if entries.is_empty() {
                    self.hosts.remove_block()
                } else {
                    self.hosts.replace_block(&entries)
                };
                match result {
                    Ok(changed) => {
                        info!(
                            "[op {}] Hosts block {} ({} entries)",
                            op,
                            if changed { "updated" } else { "unchanged" },
                            entries.len()
                        );
                        Reply::ok()
                    }
                    Err(e) => {
                        warn!("[op {}] Failed to update {}: {}", op, self.hosts.path().display(), e);
                        Reply::failed(e.to_string())
                    }
                }
            }
            Request::FlushDnsCache => match self.flusher.flush() {
                Ok(()) => {
                    info!("[op {}] DNS cache flushed", op);
                    Reply::Flushed { success: true }
                }
                Err(e) => {
                    warn!("[op {}] DNS cache flush failed: {}", op, e);
                    Reply::Flushed { success: false }
                }
            },
            Request::GetVersion => Reply::Version {
                version: HELPER_VERSION.to_string(),
            },
        }
    }
}

fn rejected(op: u64, method: &str, error: ValidationError) -> Reply {
    warn!("[op {}] Rejected {}: {}", op, method, error);
    Reply::Rejected {
        reason: error.to_string(),
    }
}

impl RequestHandler for Executor {
    fn handle(&self, request: Request) -> Reply {
        self.execute(request)
    }
}
