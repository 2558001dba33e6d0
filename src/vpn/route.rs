//! Route identities and installed-route bookkeeping

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Destination of a bypass route. Identity key for route tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteTarget {
    destination: IpNet,
    is_network: bool,
}

impl RouteTarget {
    /// Host route for a single address (/32 or /128)
    pub fn host(ip: IpAddr) -> Self {
        Self {
            destination: IpNet::from(ip),
            is_network: false,
        }
    }

    /// Network route; host bits of the prefix are cleared
    pub fn network(net: IpNet) -> Self {
        Self {
            destination: net.trunc(),
            is_network: true,
        }
    }

    pub fn destination(&self) -> IpNet {
        self.destination
    }

    pub fn addr(&self) -> IpAddr {
        self.destination.addr()
    }

    pub fn is_network(&self) -> bool {
        self.is_network
    }

    pub fn is_ipv4(&self) -> bool {
        self.destination.addr().is_ipv4()
    }

    /// Destination string as sent over the wire: bare address for hosts,
    /// CIDR notation for networks.
    pub fn wire_destination(&self) -> String {
        if self.is_network {
            self.destination.to_string()
        } else {
            self.destination.addr().to_string()
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_destination())
    }
}

/// Where a desired route came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    Domain,
    Service,
    Manual,
}

/// Why a target is wanted: the source kind plus the entry that asked for it
/// (domain name, service id or the literal manual entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOrigin {
    pub source: RouteSource,
    pub label: String,
}

impl RouteOrigin {
    pub fn new(source: RouteSource, label: impl Into<String>) -> Self {
        Self {
            source,
            label: label.into(),
        }
    }
}

/// A route the executor confirmed as installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRoute {
    pub target: RouteTarget,
    pub gateway: IpAddr,
    pub source: RouteSource,
    pub label: String,
    pub installed_at: DateTime<Utc>,
}

impl ActiveRoute {
    pub fn new(target: RouteTarget, gateway: IpAddr, origin: RouteOrigin) -> Self {
        Self {
            target,
            gateway,
            source: origin.source,
            label: origin.label,
            installed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_target_wire_form() {
        let target = RouteTarget::host("93.184.216.34".parse().unwrap());
        assert!(!target.is_network());
        assert_eq!(target.wire_destination(), "93.184.216.34");
        assert_eq!(target.destination().prefix_len(), 32);
    }

    #[test]
    fn test_network_target_is_truncated() {
        let target = RouteTarget::network("91.108.5.7/22".parse().unwrap());
        assert!(target.is_network());
        assert_eq!(target.to_string(), "91.108.4.0/22");
    }

    #[test]
    fn test_host_and_network_are_distinct_identities() {
        let host = RouteTarget::host("10.0.0.0".parse().unwrap());
        let net = RouteTarget::network("10.0.0.0/32".parse().unwrap());
        assert_ne!(host, net);
    }

    #[test]
    fn test_ipv6_host_target() {
        let target = RouteTarget::host("2001:db8::1".parse().unwrap());
        assert!(!target.is_ipv4());
        assert_eq!(target.destination().prefix_len(), 128);
        assert_eq!(target.to_string(), "2001:db8::1");
    }
}
