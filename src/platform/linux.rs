//! Linux-specific routing and network inspection
//!
//! Routes go through iproute2. Interfaces come from sysfs and the IPv4
//! default routes from `/proc/net/route`.
#![cfg_attr(not(target_os = "linux"), allow(dead_code))]

use super::{run, stderr_of, CommandFlusher, FlushChain, NetworkInspector, PlatformError, RoutingManager};
use crate::network::{DefaultRoute, InterfaceInfo, InterfaceKind};
use crate::vpn::route::RouteTarget;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

pub const MONITOR_COMMAND: (&str, &[&str]) = ("ip", &["-o", "monitor", "link", "address", "route"]);

const ARPHRD_LOOPBACK: u32 = 772;
/// ARPHRD types used by tunnel devices: NONE (tun, wireguard), PPP,
/// TUNNEL, TUNNEL6, IPGRE
const TUNNEL_ARPHRD: &[u32] = &[65534, 512, 768, 769, 778];
const TUNNEL_PREFIXES: &[&str] = &["tun", "tap", "wg", "ppp", "ipsec", "utun"];

const IFF_UP: u32 = 0x1;
const RTF_GATEWAY: u32 = 0x2;

pub struct LinuxRoutingManager;

impl LinuxRoutingManager {
    pub fn new() -> Self {
        Self
    }

    fn family_args(target: &RouteTarget) -> &'static [&'static str] {
        if target.is_ipv4() { &[] } else { &["-6"] }
    }

    /// Whether the route to `destination` already points at `gateway`
    fn route_matches(&self, target: &RouteTarget, gateway: IpAddr) -> bool {
        let destination = target.destination().to_string();
        let mut args: Vec<&str> = Self::family_args(target).to_vec();
        args.extend(["route", "show", "exact", destination.as_str()]);

        match run("ip", &args) {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let via = format!("via {} ", gateway);
                stdout.lines().any(|line| format!("{} ", line.trim()).contains(&via))
            }
            _ => false,
        }
    }
}

impl Default for LinuxRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingManager for LinuxRoutingManager {
    fn add_route(&self, target: &RouteTarget, gateway: IpAddr) -> Result<(), PlatformError> {
        let destination = target.destination().to_string();
        let gateway_str = gateway.to_string();
        let mut args: Vec<&str> = Self::family_args(target).to_vec();
        args.extend(["route", "add", destination.as_str(), "via", gateway_str.as_str()]);

        let output = run("ip", &args)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = stderr_of(&output);
        if stderr.contains("File exists") {
            if self.route_matches(target, gateway) {
                return Ok(());
            }
            return Err(PlatformError::AddRouteError(format!(
                "a different route to {} already exists",
                destination
            )));
        }
        Err(PlatformError::AddRouteError(stderr))
    }

    fn delete_route(&self, target: &RouteTarget) -> Result<(), PlatformError> {
        let destination = target.destination().to_string();
        let mut args: Vec<&str> = Self::family_args(target).to_vec();
        args.extend(["route", "delete", destination.as_str()]);

        let output = run("ip", &args)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = stderr_of(&output);
        if stderr.contains("No such process") {
            return Ok(());
        }
        Err(PlatformError::DeleteRouteError(stderr))
    }
}

pub struct LinuxNetworkInspector {
    sys_class_net: PathBuf,
    proc_net_route: PathBuf,
}

impl LinuxNetworkInspector {
    pub fn new() -> Self {
        Self {
            sys_class_net: PathBuf::from("/sys/class/net"),
            proc_net_route: PathBuf::from("/proc/net/route"),
        }
    }
}

impl Default for LinuxNetworkInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInspector for LinuxNetworkInspector {
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, PlatformError> {
        let entries = fs::read_dir(&self.sys_class_net)
            .map_err(|e| PlatformError::InspectError(e.to_string()))?;

        let mut interfaces = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let dir = entry.path();
            let arphrd = read_number(&dir.join("type"), 10).unwrap_or(0);
            let flags = read_number(&dir.join("flags"), 16).unwrap_or(0);
            interfaces.push(InterfaceInfo {
                kind: classify(&name, arphrd),
                up: flags & IFF_UP != 0,
                name,
            });
        }
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }

    fn default_routes(&self) -> Result<Vec<DefaultRoute>, PlatformError> {
        let content = fs::read_to_string(&self.proc_net_route)
            .map_err(|e| PlatformError::InspectError(e.to_string()))?;
        Ok(parse_proc_net_route(&content))
    }
}

fn read_number(path: &std::path::Path, radix: u32) -> Option<u32> {
    let raw = fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u32::from_str_radix(digits, radix).ok()
}

pub(crate) fn classify(name: &str, arphrd: u32) -> InterfaceKind {
    if arphrd == ARPHRD_LOOPBACK || name == "lo" {
        InterfaceKind::Loopback
    } else if TUNNEL_ARPHRD.contains(&arphrd) || TUNNEL_PREFIXES.iter().any(|p| name.starts_with(p)) {
        InterfaceKind::Tunnel
    } else {
        InterfaceKind::Other
    }
}

/// `/proc/net/route` prints addresses as the raw in-memory u32
fn hex_to_ipv4(hex: &str) -> Option<Ipv4Addr> {
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(raw.to_ne_bytes()))
}

/// Extract default and split-default routes from `/proc/net/route`
pub(crate) fn parse_proc_net_route(content: &str) -> Vec<DefaultRoute> {
    let half = Ipv4Addr::new(128, 0, 0, 0);
    let mut routes = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let (Some(dest), Some(gw), Some(mask)) =
            (hex_to_ipv4(fields[1]), hex_to_ipv4(fields[2]), hex_to_ipv4(fields[7]))
        else {
            continue;
        };
        let flags = u32::from_str_radix(fields[3], 16).unwrap_or(0);
        let metric = fields[6].parse().unwrap_or(0);

        let is_default = dest.is_unspecified() && mask.is_unspecified();
        let split = mask == half && (dest.is_unspecified() || dest == half);
        if !is_default && !split {
            continue;
        }

        let gateway = (flags & RTF_GATEWAY != 0 && !gw.is_unspecified()).then_some(IpAddr::V4(gw));
        routes.push(DefaultRoute {
            interface: fields[0].to_string(),
            gateway,
            metric,
            split,
        });
    }
    routes
}

pub fn cache_flusher() -> FlushChain {
    FlushChain::new(vec![
        Box::new(CommandFlusher::new("resolvectl", &["flush-caches"])),
        Box::new(CommandFlusher::new("systemd-resolve", &["--flush-caches"])),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROC_NET_ROUTE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
tun0\t00000000\t00000000\t0001\t0\t0\t0\t00000080\t0\t0\t0
tun0\t00000080\t00000000\t0001\t0\t0\t0\t00000080\t0\t0\t0
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";

    #[test]
    fn test_classify() {
        assert_eq!(classify("lo", 772), InterfaceKind::Loopback);
        assert_eq!(classify("wg0", 65534), InterfaceKind::Tunnel);
        assert_eq!(classify("ppp0", 512), InterfaceKind::Tunnel);
        assert_eq!(classify("tap1", 1), InterfaceKind::Tunnel);
        assert_eq!(classify("eth0", 1), InterfaceKind::Other);
        assert_eq!(classify("wlp2s0", 1), InterfaceKind::Other);
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_parse_proc_net_route() {
        let routes = parse_proc_net_route(PROC_NET_ROUTE);

        assert_eq!(routes.len(), 3);
        assert!(routes[0].split && routes[1].split);
        assert_eq!(routes[0].interface, "tun0");
        assert_eq!(routes[0].gateway, None);

        assert_eq!(routes[2].interface, "eth0");
        assert!(!routes[2].split);
        assert_eq!(routes[2].metric, 100);
        assert_eq!(routes[2].gateway, Some("192.168.1.1".parse().unwrap()));
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_detect_from_proc() {
        let routes = parse_proc_net_route(PROC_NET_ROUTE);
        let interfaces = vec![
            InterfaceInfo { name: "eth0".into(), kind: classify("eth0", 1), up: true },
            InterfaceInfo { name: "tun0".into(), kind: classify("tun0", 65534), up: true },
        ];

        let snapshot = crate::network::detect(&interfaces, &routes);
        assert_eq!(snapshot.vpn_interface.as_deref(), Some("tun0"));
        assert_eq!(snapshot.local_gateway, Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_skips_garbage() {
        assert!(parse_proc_net_route("header\nshort line\n").is_empty());
        assert!(parse_proc_net_route("").is_empty());
    }

    #[test]
    fn test_inspector_reads_sysfs_layout() {
        let temp_dir = TempDir::new().unwrap();
        let net = temp_dir.path().join("net");
        for (name, arphrd, flags) in [("eth0", "1", "0x1003"), ("wg0", "65534", "0x91"), ("tun9", "65534", "0x1090")] {
            let dir = net.join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("type"), format!("{}\n", arphrd)).unwrap();
            fs::write(dir.join("flags"), format!("{}\n", flags)).unwrap();
        }
        let inspector = LinuxNetworkInspector {
            sys_class_net: net,
            proc_net_route: temp_dir.path().join("route"),
        };

        let interfaces = inspector.interfaces().unwrap();
        assert_eq!(interfaces.len(), 3);
        assert_eq!(interfaces[0].name, "eth0");
        assert!(interfaces[0].up);
        assert_eq!(interfaces[2].name, "wg0");
        assert_eq!(interfaces[2].kind, InterfaceKind::Tunnel);
        assert!(interfaces[2].up);
        assert!(!interfaces[1].up);

        // Missing route table degrades to a disconnected-looking snapshot
        assert!(inspector.default_routes().is_err());
        let snapshot = inspector.snapshot();
        assert_eq!(snapshot.vpn_interface.as_deref(), Some("wg0"));
        assert_eq!(snapshot.local_gateway, None);
    }
}
