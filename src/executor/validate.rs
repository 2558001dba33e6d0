//! Input validation for privileged requests
//!
//! Everything arriving over the socket is untrusted text. Nothing reaches
//! the routing table or the hosts file until it has been parsed into a
//! typed value here.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

use crate::rpc::protocol::HostsRecord;
use crate::vpn::hosts::{HostsEntry, is_valid_hostname};
use crate::vpn::route::RouteTarget;

pub const MAX_HOSTS_ENTRIES: usize = 2048;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
    #[error("Destination {0} does not match the requested route kind")]
    KindMismatch(String),
    #[error("Refusing to route reserved destination {0}")]
    ReservedDestination(String),
    #[error("Invalid gateway: {0}")]
    InvalidGateway(String),
    #[error("Gateway {gateway} is not in the same address family as {destination}")]
    FamilyMismatch { destination: String, gateway: String },
    #[error("Invalid hostname: {0:?}")]
    InvalidHostname(String),
    #[error("Invalid address for {domain}: {ip:?}")]
    InvalidAddress { domain: String, ip: String },
    #[error("Too many hosts entries: {0} (max {MAX_HOSTS_ENTRIES})")]
    TooManyEntries(usize),
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_reserved(ip: IpAddr) -> bool {
    let broadcast = matches!(ip, IpAddr::V4(v4) if v4.is_broadcast());
    ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() || broadcast || is_link_local(ip)
}

/// Parse a destination and check it against the declared kind. Host
/// destinations are bare addresses, network destinations are CIDR.
/// Unparseable text is `InvalidDestination` whatever kind was declared.
pub fn route_target(destination: &str, is_network: bool) -> Result<RouteTarget, ValidationError> {
    let destination = destination.trim();
    let target = if let Ok(ip) = destination.parse::<IpAddr>() {
        if is_network {
            return Err(ValidationError::KindMismatch(destination.to_string()));
        }
        RouteTarget::host(ip)
    } else if let Ok(net) = destination.parse::<IpNet>() {
        if !is_network {
            return Err(ValidationError::KindMismatch(destination.to_string()));
        }
        if net.prefix_len() == 0 {
            return Err(ValidationError::ReservedDestination(destination.to_string()));
        }
        RouteTarget::network(net)
    } else {
        return Err(ValidationError::InvalidDestination(destination.to_string()));
    };

    if is_reserved(target.addr()) {
        return Err(ValidationError::ReservedDestination(destination.to_string()));
    }
    Ok(target)
}

/// Removal requests carry no kind flag; it is implied by the notation
pub fn removal_target(destination: &str) -> Result<RouteTarget, ValidationError> {
    route_target(destination, destination.contains('/'))
}

pub fn gateway(raw: &str, target: &RouteTarget) -> Result<IpAddr, ValidationError> {
    let ip: IpAddr = raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidGateway(raw.to_string()))?;
    if ip.is_unspecified() || ip.is_multicast() || ip.is_loopback() {
        return Err(ValidationError::InvalidGateway(raw.to_string()));
    }
    if ip.is_ipv4() != target.is_ipv4() {
        return Err(ValidationError::FamilyMismatch {
            destination: target.to_string(),
            gateway: raw.to_string(),
        });
    }
    Ok(ip)
}

pub fn hosts_entries(records: &[HostsRecord]) -> Result<Vec<HostsEntry>, ValidationError> {
    if records.len() > MAX_HOSTS_ENTRIES {
        return Err(ValidationError::TooManyEntries(records.len()));
    }
    records
        .iter()
        .map(|record| {
            let domain = record.domain.trim().to_ascii_lowercase();
            if !is_valid_hostname(&domain) {
                return Err(ValidationError::InvalidHostname(record.domain.clone()));
            }
            let ip: IpAddr = record.ip.trim().parse().map_err(|_| ValidationError::InvalidAddress {
                domain: domain.clone(),
                ip: record.ip.clone(),
            })?;
            if ip.is_unspecified() {
                return Err(ValidationError::InvalidAddress {
                    domain,
                    ip: record.ip.clone(),
                });
            }
            Ok(HostsEntry::new(domain, ip))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_and_network_targets() {
        let host = route_target("93.184.216.34", false).unwrap();
        assert!(!host.is_network());
        assert_eq!(host.to_string(), "93.184.216.34");

        let net = route_target("91.108.4.0/22", true).unwrap();
        assert!(net.is_network());

        let v6 = route_target("2001:67c:4e8::/48", true).unwrap();
        assert!(!v6.is_ipv4());
    }

    #[test]
    fn test_kind_must_match_notation() {
        assert_eq!(
            route_target("10.0.0.0/8", false),
            Err(ValidationError::KindMismatch("10.0.0.0/8".into()))
        );
        assert_eq!(
            route_target("10.0.0.1", true),
            Err(ValidationError::KindMismatch("10.0.0.1".into()))
        );
    }

    #[test]
    fn test_reserved_destinations() {
        for dest in ["0.0.0.0", "127.0.0.1", "224.0.0.1", "169.254.1.1", "255.255.255.255", "::1", "fe80::1"] {
            assert!(
                matches!(route_target(dest, false), Err(ValidationError::ReservedDestination(_))),
                "{} should be reserved",
                dest
            );
        }
        assert!(matches!(
            route_target("0.0.0.0/0", true),
            Err(ValidationError::ReservedDestination(_))
        ));
        assert!(matches!(
            route_target("127.0.0.0/8", true),
            Err(ValidationError::ReservedDestination(_))
        ));
    }

    #[test]
    fn test_garbage_destination() {
        for is_network in [false, true] {
            assert!(matches!(
                route_target("example.com; rm -rf /", is_network),
                Err(ValidationError::InvalidDestination(_))
            ));
            assert!(matches!(
                route_target("10.0.0.0/33", is_network),
                Err(ValidationError::InvalidDestination(_))
            ));
        }
    }

    #[test]
    fn test_removal_infers_kind() {
        assert!(removal_target("10.0.0.0/8").unwrap().is_network());
        assert!(!removal_target("10.0.0.1").unwrap().is_network());
    }

    #[test]
    fn test_gateway_checks() {
        let v4 = route_target("93.184.216.34", false).unwrap();
        assert_eq!(gateway("192.168.1.1", &v4).unwrap(), "192.168.1.1".parse::<IpAddr>().unwrap());
        assert!(matches!(gateway("fe80::1", &v4), Err(ValidationError::FamilyMismatch { .. })));
        assert!(matches!(gateway("0.0.0.0", &v4), Err(ValidationError::InvalidGateway(_))));
        assert!(matches!(gateway("router", &v4), Err(ValidationError::InvalidGateway(_))));
    }

    #[test]
    fn test_hosts_entries() {
        let records = vec![HostsRecord {
            domain: "Example.COM".into(),
            ip: "93.184.216.34".into(),
        }];
        let entries = hosts_entries(&records).unwrap();
        assert_eq!(entries[0].domain, "example.com");

        let smuggled = vec![HostsRecord {
            domain: "evil.com\n1.2.3.4 bank.com".into(),
            ip: "1.2.3.4".into(),
        }];
        assert!(matches!(hosts_entries(&smuggled), Err(ValidationError::InvalidHostname(_))));

        let bad_ip = vec![HostsRecord {
            domain: "example.com".into(),
            ip: "1.2.3".into(),
        }];
        assert!(matches!(hosts_entries(&bad_ip), Err(ValidationError::InvalidAddress { .. })));
    }

    #[test]
    fn test_hosts_entry_limit() {
        let records: Vec<_> = (0..=MAX_HOSTS_ENTRIES)
            .map(|i| HostsRecord {
                domain: format!("h{}.example.com", i),
                ip: "10.0.0.1".into(),
            })
            .collect();
        assert_eq!(
            hosts_entries(&records),
            Err(ValidationError::TooManyEntries(MAX_HOSTS_ENTRIES + 1))
        );
    }
}
