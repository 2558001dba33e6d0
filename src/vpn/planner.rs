//! Route planner
//!
//! Turns a configuration and a network snapshot into the set of routes and
//! hosts entries that should exist. Stateless: it never looks at what is
//! installed, so the same inputs always give the same plan.

use crate::config::{Configuration, EntryKind};
use crate::network::NetworkSnapshot;
use crate::vpn::hosts::HostsEntry;
use crate::vpn::resolve::Resolve;
use crate::vpn::route::{RouteOrigin, RouteSource, RouteTarget};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// Something the planner had to leave out of this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanIssue {
    /// The name did not resolve; its target is skipped
    Unresolved { domain: String, reason: String },
    /// Resolved address family does not match the gateway
    FamilyMismatch { domain: String, ip: IpAddr },
    /// Entry text is neither a hostname nor an address
    Invalid { entry: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    /// Wanted targets with the first entry that asked for each
    pub routes: BTreeMap<RouteTarget, RouteOrigin>,
    pub hosts_entries: BTreeSet<HostsEntry>,
    /// Fresh resolutions, keyed by domain string, for the entry cache
    pub resolved: BTreeMap<String, IpAddr>,
    pub issues: Vec<PlanIssue>,
}

struct Builder<'a> {
    gateway: IpAddr,
    manage_hosts: bool,
    resolver: &'a dyn Resolve,
    state: DesiredState,
}

impl Builder<'_> {
    fn add_target(&mut self, target: RouteTarget, origin: RouteOrigin) {
        // First claimant wins so every target maps to exactly one entry
        self.state.routes.entry(target).or_insert(origin);
    }

    async fn add_host(&mut self, domain: &str, cached: Option<IpAddr>, source: RouteSource, label: &str) {
        let ip = match cached {
            Some(ip) => ip,
            None => match self.resolver.resolve(domain).await {
                Ok(ip) => {
                    self.state.resolved.insert(domain.to_string(), ip);
                    ip
                }
                Err(e) => {
                    self.state.issues.push(PlanIssue::Unresolved {
                        domain: domain.to_string(),
                        reason: e.to_string(),
                    });
                    return;
                }
            },
        };

        if ip.is_ipv4() != self.gateway.is_ipv4() {
            self.state.issues.push(PlanIssue::FamilyMismatch {
                domain: domain.to_string(),
                ip,
            });
            return;
        }

        self.add_target(RouteTarget::host(ip), RouteOrigin::new(source, label));
        if self.manage_hosts {
            self.state.hosts_entries.insert(HostsEntry::new(domain, ip));
        }
    }

    fn add_literal(&mut self, target: RouteTarget, entry: &str) {
        if target.is_ipv4() != self.gateway.is_ipv4() {
            self.state.issues.push(PlanIssue::FamilyMismatch {
                domain: entry.to_string(),
                ip: target.addr(),
            });
            return;
        }
        self.add_target(target, RouteOrigin::new(RouteSource::Manual, entry));
    }
}

/// Compute the desired state. Nothing is planned unless a VPN is up and a
/// local gateway is known.
pub async fn plan(
    config: &Configuration,
    snapshot: &NetworkSnapshot,
    resolver: &dyn Resolve,
) -> DesiredState {
    let Some(gateway) = snapshot.local_gateway.filter(|_| snapshot.vpn_connected) else {
        return DesiredState::default();
    };

    let mut builder = Builder {
        gateway,
        manage_hosts: config.manage_hosts_file,
        resolver,
        state: DesiredState::default(),
    };

    for entry in config.domains.iter().filter(|d| d.enabled) {
        match entry.kind() {
            Some(EntryKind::Host(name)) => {
                builder
                    .add_host(&name, entry.resolved_ip, RouteSource::Domain, &name)
                    .await;
            }
            Some(EntryKind::Address(ip)) => builder.add_literal(RouteTarget::host(ip), &entry.domain),
            Some(EntryKind::Network(net)) => {
                builder.add_literal(RouteTarget::network(net), &entry.domain)
            }
            None => builder.state.issues.push(PlanIssue::Invalid {
                entry: entry.domain.clone(),
            }),
        }
    }

    for service in config.services.iter().filter(|s| s.enabled) {
        for range in &service.ip_ranges {
            if range.addr().is_ipv4() == gateway.is_ipv4() {
                builder.add_target(
                    RouteTarget::network(*range),
                    RouteOrigin::new(RouteSource::Service, &service.id),
                );
            }
        }
        for domain in &service.domains {
            builder
                .add_host(domain, None, RouteSource::Service, &service.id)
                .await;
        }
    }

    builder.state
}
