//! Network/VPN state detection
//!
//! [`detect`] applies the VPN detection policy to raw interface and routing
//! table data from the platform layer; [`observer::NetworkObserver`] turns
//! that into a debounced stream of [`NetworkSnapshot`]s.

pub mod observer;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub use observer::NetworkObserver;

/// VPN state at one point in time. Always replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub vpn_interface: Option<String>,
    pub vpn_connected: bool,
    pub local_gateway: Option<IpAddr>,
}

/// Coarse interface class as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Tunnel/VPN class (tun, utun, ppp, ipsec, wireguard, …)
    Tunnel,
    Loopback,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub kind: InterfaceKind,
    pub up: bool,
}

/// A route that carries default traffic: a real `0.0.0.0/0` or one half of
/// the `0/1` + `128/1` pair VPN clients install to override it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub interface: String,
    pub gateway: Option<IpAddr>,
    pub metric: u32,
    pub split: bool,
}

/// Apply the detection policy.
///
/// A VPN is connected iff an up tunnel-class interface exists. If one of
/// them is the egress of the preferred default route it wins, otherwise the
/// first tunnel interface does. The local gateway is the gateway of the
/// best default route not leaving through the VPN interface.
pub fn detect(interfaces: &[InterfaceInfo], routes: &[DefaultRoute]) -> NetworkSnapshot {
    let tunnels: Vec<&InterfaceInfo> = interfaces
        .iter()
        .filter(|i| i.up && i.kind == InterfaceKind::Tunnel)
        .collect();

    // Split routes are more specific than /0, so they take priority
    let mut ordered: Vec<&DefaultRoute> = routes.iter().collect();
    ordered.sort_by_key(|r| (!r.split, r.metric));

    let vpn_interface = ordered
        .iter()
        .find_map(|r| tunnels.iter().find(|t| t.name == r.interface))
        .or_else(|| tunnels.first())
        .map(|t| t.name.clone());

    let local_gateway = ordered
        .iter()
        .filter(|r| !r.split)
        .filter(|r| Some(&r.interface) != vpn_interface.as_ref())
        .filter(|r| {
            // Never hand out a tunnel's own gateway as the local one
            !tunnels.iter().any(|t| t.name == r.interface)
        })
        .find_map(|r| r.gateway);

    NetworkSnapshot {
        vpn_connected: vpn_interface.is_some(),
        vpn_interface,
        local_gateway,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, kind: InterfaceKind, up: bool) -> InterfaceInfo {
        InterfaceInfo {
            name: name.to_string(),
            kind,
            up,
        }
    }

    fn route(interface: &str, gateway: Option<&str>, metric: u32, split: bool) -> DefaultRoute {
        DefaultRoute {
            interface: interface.to_string(),
            gateway: gateway.map(|g| g.parse().unwrap()),
            metric,
            split,
        }
    }

    #[test]
    fn test_no_tunnel_means_disconnected() {
        let interfaces = [
            iface("lo", InterfaceKind::Loopback, true),
            iface("eth0", InterfaceKind::Other, true),
        ];
        let routes = [route("eth0", Some("192.168.1.1"), 100, false)];

        let snapshot = detect(&interfaces, &routes);
        assert!(!snapshot.vpn_connected);
        assert_eq!(snapshot.vpn_interface, None);
        assert_eq!(snapshot.local_gateway, Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_down_tunnel_ignored() {
        let interfaces = [
            iface("eth0", InterfaceKind::Other, true),
            iface("tun0", InterfaceKind::Tunnel, false),
        ];
        assert!(!detect(&interfaces, &[]).vpn_connected);
    }

    #[test]
    fn test_full_tunnel_vpn() {
        let interfaces = [
            iface("eth0", InterfaceKind::Other, true),
            iface("wg0", InterfaceKind::Tunnel, true),
            iface("tun0", InterfaceKind::Tunnel, true),
        ];
        let routes = [
            route("tun0", None, 0, true),
            route("tun0", None, 0, true),
            route("eth0", Some("192.168.1.1"), 100, false),
        ];

        let snapshot = detect(&interfaces, &routes);
        assert!(snapshot.vpn_connected);
        assert_eq!(snapshot.vpn_interface.as_deref(), Some("tun0"));
        assert_eq!(snapshot.local_gateway, Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_vpn_default_route_by_metric() {
        let interfaces = [
            iface("en0", InterfaceKind::Other, true),
            iface("utun3", InterfaceKind::Tunnel, true),
        ];
        let routes = [
            route("en0", Some("10.0.0.1"), 600, false),
            route("utun3", Some("172.16.0.1"), 50, false),
        ];

        let snapshot = detect(&interfaces, &routes);
        assert_eq!(snapshot.vpn_interface.as_deref(), Some("utun3"));
        assert_eq!(snapshot.local_gateway, Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_split_tunnel_vpn_falls_back_to_first_tunnel() {
        let interfaces = [
            iface("eth0", InterfaceKind::Other, true),
            iface("ppp0", InterfaceKind::Tunnel, true),
        ];
        let routes = [route("eth0", Some("192.168.0.254"), 0, false)];

        let snapshot = detect(&interfaces, &routes);
        assert_eq!(snapshot.vpn_interface.as_deref(), Some("ppp0"));
        assert_eq!(snapshot.local_gateway, Some("192.168.0.254".parse().unwrap()));
    }

    #[test]
    fn test_vpn_without_local_gateway() {
        let interfaces = [iface("tun0", InterfaceKind::Tunnel, true)];
        let routes = [route("tun0", Some("10.8.0.1"), 0, false)];

        let snapshot = detect(&interfaces, &routes);
        assert!(snapshot.vpn_connected);
        assert_eq!(snapshot.local_gateway, None);
    }
}
