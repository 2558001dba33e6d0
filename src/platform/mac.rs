//! macOS-specific routing and network inspection
#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

use super::{run, stderr_of, CommandFlusher, FlushChain, NetworkInspector, PlatformError, RoutingManager};
use crate::network::{DefaultRoute, InterfaceInfo, InterfaceKind};
use crate::vpn::route::RouteTarget;
use std::net::IpAddr;

pub const MONITOR_COMMAND: (&str, &[&str]) = ("route", &["-n", "monitor"]);

const TUNNEL_PREFIXES: &[&str] = &["utun", "ipsec", "ppp", "tun", "tap", "wg"];

/// Interface-scoped routes (flag `I`) only apply to traffic bound to that
/// interface; rank them after the unscoped ones.
const SCOPED_PENALTY: u32 = 1000;

pub struct MacRoutingManager;

impl MacRoutingManager {
    pub fn new() -> Self {
        Self
    }

    /// `route -n <command> <family> -host|-net`
    fn command_args(command: &'static str, target: &RouteTarget) -> Vec<&'static str> {
        let family = if target.is_ipv4() { "-inet" } else { "-inet6" };
        let kind = if target.is_network() { "-net" } else { "-host" };
        vec!["-n", command, family, kind]
    }

    fn route_matches(&self, target: &RouteTarget, gateway: IpAddr) -> bool {
        let destination = target.wire_destination();
        let mut args = vec!["-n", "get"];
        if !target.is_ipv4() {
            args.push("-inet6");
        }
        args.push(destination.as_str());

        match run("route", &args) {
            Ok(output) if output.status.success() => {
                parse_route_get_gateway(&String::from_utf8_lossy(&output.stdout)) == Some(gateway)
            }
            _ => false,
        }
    }
}

impl Default for MacRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingManager for MacRoutingManager {
    fn add_route(&self, target: &RouteTarget, gateway: IpAddr) -> Result<(), PlatformError> {
        let destination = target.wire_destination();
        let gateway_str = gateway.to_string();
        let mut args: Vec<&str> = Self::command_args("add", target);
        args.extend([destination.as_str(), gateway_str.as_str()]);

        let output = run("route", &args)?;
        let stderr = stderr_of(&output);
        // route(8) exits 0 on some failures, so check stderr too
        if output.status.success() && stderr.is_empty() {
            return Ok(());
        }

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
        let destination = target.wire_destination();
        let mut args: Vec<&str> = Self::command_args("delete", target);
        args.push(destination.as_str());

        let output = run("route", &args)?;
        let stderr = stderr_of(&output);
        if output.status.success() && stderr.is_empty() {
            return Ok(());
        }
        if stderr.contains("not in table") {
            return Ok(());
        }
        Err(PlatformError::DeleteRouteError(stderr))
    }
}

pub struct MacNetworkInspector;

impl MacNetworkInspector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MacNetworkInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInspector for MacNetworkInspector {
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, PlatformError> {
        let output = run("ifconfig", &[])?;
        if !output.status.success() {
            return Err(PlatformError::InspectError(stderr_of(&output)));
        }
        Ok(parse_ifconfig(&String::from_utf8_lossy(&output.stdout)))
    }

    fn default_routes(&self) -> Result<Vec<DefaultRoute>, PlatformError> {
        let output = run("netstat", &["-rn", "-f", "inet"])?;
        if !output.status.success() {
            return Err(PlatformError::InspectError(stderr_of(&output)));
        }
        Ok(parse_netstat(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `ifconfig` output. A tunnel only counts as up when it also carries
/// an IPv4 address: macOS keeps several idle utun devices around.
pub(crate) fn parse_ifconfig(output: &str) -> Vec<InterfaceInfo> {
    struct Pending {
        name: String,
        flags: Vec<String>,
        has_inet: bool,
    }

    fn finish(p: Pending) -> InterfaceInfo {
        let flag = |f: &str| p.flags.iter().any(|x| x == f);
        let kind = if flag("LOOPBACK") {
            InterfaceKind::Loopback
        } else if flag("POINTOPOINT") || TUNNEL_PREFIXES.iter().any(|pre| p.name.starts_with(pre)) {
            InterfaceKind::Tunnel
        } else {
            InterfaceKind::Other
        };
        let up = flag("UP") && (kind != InterfaceKind::Tunnel || p.has_inet);
        InterfaceInfo {
            name: p.name,
            kind,
            up,
        }
    }

    let mut interfaces = Vec::new();
    let mut current: Option<Pending> = None;

    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            if let Some(p) = current.take() {
                interfaces.push(finish(p));
            }
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let flags = rest
                .split_once('<')
                .and_then(|(_, r)| r.split_once('>'))
                .map(|(f, _)| f.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            current = Some(Pending {
                name: name.to_string(),
                flags,
                has_inet: false,
            });
        } else if let Some(p) = current.as_mut() {
            if line.trim_start().starts_with("inet ") {
                p.has_inet = true;
            }
        }
    }
    if let Some(p) = current.take() {
        interfaces.push(finish(p));
    }
    interfaces
}

/// Parse the IPv4 section of `netstat -rn`. Listing order is used as the
/// metric since macOS prints the primary default first.
pub(crate) fn parse_netstat(output: &str) -> Vec<DefaultRoute> {
    let mut routes = Vec::new();
    let mut position = 0;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let (destination, gateway, flags, netif) = (fields[0], fields[1], fields[2], fields[3]);

        let split = matches!(destination, "0/1" | "128.0/1" | "0.0.0.0/1" | "128.0.0.0/1");
        if destination != "default" && !split {
            continue;
        }

        let mut metric = position;
        if flags.contains('I') {
            metric += SCOPED_PENALTY;
        }
        position += 1;

        routes.push(DefaultRoute {
            interface: netif.to_string(),
            gateway: gateway.parse::<IpAddr>().ok(),
            metric,
            split,
        });
    }
    routes
}

/// Extract `gateway:` from `route -n get` output
fn parse_route_get_gateway(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("gateway:")
            .and_then(|gw| gw.trim().parse().ok())
    })
}

pub fn cache_flusher() -> FlushChain {
    FlushChain::new(vec![
        Box::new(CommandFlusher::new("killall", &["-HUP", "mDNSResponder"])),
        Box::new(CommandFlusher::new("dscacheutil", &["-flushcache"])),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const IFCONFIG: &str = "\
lo0: flags=8049<UP,LOOPBACK,RUNNING,MULTICAST> mtu 16384
\tinet 127.0.0.1 netmask 0xff000000
en0: flags=8863<UP,BROADCAST,SMART,RUNNING,SIMPLEX,MULTICAST> mtu 1500
\tether a4:83:e7:00:00:00
\tinet 192.168.1.23 netmask 0xffffff00 broadcast 192.168.1.255
utun0: flags=8051<UP,POINTOPOINT,RUNNING,MULTICAST> mtu 1380
\tinet6 fe80::1%utun0 prefixlen 64 scopeid 0x10
utun4: flags=8051<UP,POINTOPOINT,RUNNING,MULTICAST> mtu 1400
\tinet 10.8.0.6 --> 10.8.0.5 netmask 0xffffffff
";

    const NETSTAT: &str = "\
Routing tables

Internet:
Destination        Gateway            Flags               Netif Expire
0/1                10.8.0.5           UGScg               utun4
default            192.168.1.1        UGScg                 en0
default            link#18            UCSIg               utun4
10.8.0.5           10.8.0.6           UH                  utun4
128.0/1            10.8.0.5           UGSc                utun4
127                127.0.0.1          UCS                   lo0
";

    #[test]
    fn test_parse_ifconfig() {
        let interfaces = parse_ifconfig(IFCONFIG);
        assert_eq!(interfaces.len(), 4);

        assert_eq!(interfaces[0].kind, InterfaceKind::Loopback);
        assert_eq!(interfaces[1].kind, InterfaceKind::Other);
        assert!(interfaces[1].up);

        // idle system utun without IPv4 is not a VPN
        assert_eq!(interfaces[2].kind, InterfaceKind::Tunnel);
        assert!(!interfaces[2].up);

        assert_eq!(interfaces[3].name, "utun4");
        assert!(interfaces[3].up);
    }

    #[test]
    fn test_parse_netstat() {
        let routes = parse_netstat(NETSTAT);
        assert_eq!(routes.len(), 4);

        assert!(routes[0].split);
        assert_eq!(routes[0].interface, "utun4");

        assert_eq!(routes[1].interface, "en0");
        assert_eq!(routes[1].gateway, Some("192.168.1.1".parse().unwrap()));

        assert_eq!(routes[2].gateway, None);
        assert!(routes[2].metric >= SCOPED_PENALTY);
        assert!(routes[3].split);
    }

    #[test]
    fn test_detect_from_mac_output() {
        let snapshot = crate::network::detect(&parse_ifconfig(IFCONFIG), &parse_netstat(NETSTAT));
        assert!(snapshot.vpn_connected);
        assert_eq!(snapshot.vpn_interface.as_deref(), Some("utun4"));
        assert_eq!(snapshot.local_gateway, Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_route_get_gateway() {
        let output = "   route to: 93.184.216.34\ndestination: 93.184.216.34\n    gateway: 192.168.1.1\n  interface: en0\n";
        assert_eq!(
            parse_route_get_gateway(output),
            Some("192.168.1.1".parse().unwrap())
        );
        assert_eq!(parse_route_get_gateway("interface: en0\n"), None);
    }
}
