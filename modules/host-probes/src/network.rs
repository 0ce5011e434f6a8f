use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, SocketAddrV6};

use async_trait::async_trait;
use ipnet::IpNet;
use nix::net::if_::InterfaceFlags;
use situation_core::{Module, ModuleError, ScanContext};
use situation_store::{NetworkInterface, NicFlags};
use tracing::debug;

/// Enumerates host interfaces, creating one NIC per kept interface and one
/// Subnetwork per non-loopback, non-link-local CIDR.
pub struct HostNetworkModule;

#[async_trait]
impl Module for HostNetworkModule {
    fn name(&self) -> &'static str {
        "host-network"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["host-basic"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let host = ctx.store.get_or_create_host()?;
        let gateways = std::fs::read_to_string("/proc/net/route")
            .map(|t| parse_route_table(&t))
            .unwrap_or_default();

        let mut interfaces: HashMap<String, Collected> = HashMap::new();
        let addrs = nix::ifaddrs::getifaddrs().map_err(anyhow::Error::from)?;
        for ifa in addrs {
            let entry = interfaces
                .entry(ifa.interface_name.clone())
                .or_insert_with(|| Collected::new(ifa.flags));
            let Some(addr) = ifa.address else { continue };
            if let Some(link) = addr.as_link_addr() {
                if let Some(mac) = link.addr() {
                    entry.mac = format_mac(&mac);
                }
            } else if let Some(sin) = addr.as_sockaddr_in() {
                let ip = IpAddr::V4(*SocketAddrV4::from(*sin).ip());
                let prefix = ifa.netmask.and_then(|m| prefix_of(&m)).unwrap_or(32);
                entry.addrs.push((ip, prefix));
            } else if let Some(sin6) = addr.as_sockaddr_in6() {
                let ip = IpAddr::V6(*SocketAddrV6::from(*sin6).ip());
                let prefix = ifa.netmask.and_then(|m| prefix_of(&m)).unwrap_or(128);
                entry.addrs.push((ip, prefix));
            }
        }

        let mut kept = 0usize;
        for (name, collected) in interfaces {
            if skip_interface(&name, collected.flags) {
                continue;
            }
            let flags = nic_flags(collected.flags);
            let gateway = gateways.get(&name).map(|g| g.to_string()).unwrap_or_default();
            let mut nic = NetworkInterface {
                id: 0,
                machine_id: Some(host.id),
                name: name.clone(),
                mac: collected.mac.clone(),
                mac_vendor: None,
                ips: collected
                    .addrs
                    .iter()
                    .map(|(ip, prefix)| format!("{ip}/{prefix}"))
                    .collect(),
                gateway,
                flags,
                tag: String::new(),
            };
            ctx.store.upsert_nic(&mut nic)?;
            kept += 1;

            for (ip, prefix) in &collected.addrs {
                if ip.is_loopback() || is_link_local(ip) {
                    continue;
                }
                let Ok(net) = IpNet::new(*ip, *prefix) else { continue };
                let gw = if ip.is_ipv4() { nic.gateway.as_str() } else { "" };
                let subnet = ctx.store.get_or_create_subnetwork(&net, gw, None)?;
                ctx.store.link_nic_subnet(nic.id, subnet)?;
            }
        }
        debug!(count = kept, "host interfaces recorded");
        Ok(())
    }
}

struct Collected {
    flags: InterfaceFlags,
    mac: String,
    addrs: Vec<(IpAddr, u8)>,
}

impl Collected {
    fn new(flags: InterfaceFlags) -> Self {
        Collected {
            flags,
            mac: String::new(),
            addrs: Vec::new(),
        }
    }
}

fn nic_flags(flags: InterfaceFlags) -> NicFlags {
    NicFlags {
        up: flags.contains(InterfaceFlags::IFF_UP),
        broadcast: flags.contains(InterfaceFlags::IFF_BROADCAST),
        loopback: flags.contains(InterfaceFlags::IFF_LOOPBACK),
        p2p: flags.contains(InterfaceFlags::IFF_POINTOPOINT),
        multicast: flags.contains(InterfaceFlags::IFF_MULTICAST),
        running: flags.contains(InterfaceFlags::IFF_RUNNING),
    }
}

/// Down, loopback and virtual (veth*, *qemu*) interfaces carry no
/// discoverable topology.
fn skip_interface(name: &str, flags: InterfaceFlags) -> bool {
    !flags.contains(InterfaceFlags::IFF_UP)
        || flags.contains(InterfaceFlags::IFF_LOOPBACK)
        || name.starts_with("veth")
        || name.contains("qemu")
}

fn format_mac(mac: &[u8; 6]) -> String {
    if mac.iter().all(|b| *b == 0) {
        return String::new();
    }
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn prefix_of(mask: &nix::sys::socket::SockaddrStorage) -> Option<u8> {
    if let Some(sin) = mask.as_sockaddr_in() {
        let octets = SocketAddrV4::from(*sin).ip().octets();
        return Some(octets.iter().map(|o| o.count_ones() as u8).sum());
    }
    if let Some(sin6) = mask.as_sockaddr_in6() {
        let octets = SocketAddrV6::from(*sin6).ip().octets();
        return Some(octets.iter().map(|o| o.count_ones() as u8).sum());
    }
    None
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// `/proc/net/route` rows are little-endian hex; the per-interface gateway
/// is the default-route entry when present, else the first gatewayed route.
fn parse_route_table(text: &str) -> HashMap<String, Ipv4Addr> {
    const RTF_GATEWAY: u64 = 0x2;
    let mut out: HashMap<String, (bool, Ipv4Addr)> = HashMap::new();
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let (iface, dest, gateway, flags) = (fields[0], fields[1], fields[2], fields[3]);
        let Ok(dest) = u32::from_str_radix(dest, 16) else { continue };
        let Ok(gw) = u32::from_str_radix(gateway, 16) else { continue };
        let Ok(flags) = u64::from_str_radix(flags, 16) else { continue };
        if gw == 0 || flags & RTF_GATEWAY == 0 {
            continue;
        }
        let gw = Ipv4Addr::from(u32::from_le_bytes(gw.to_ne_bytes()).to_be());
        let is_default = dest == 0;
        match out.get(iface) {
            Some((true, _)) => {}
            Some((false, _)) if is_default => {
                out.insert(iface.to_string(), (true, gw));
            }
            Some(_) => {}
            None => {
                out.insert(iface.to_string(), (is_default, gw));
            }
        }
    }
    out.into_iter().map(|(k, (_, v))| (k, v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_table_decodes_little_endian_gateway() {
        let text = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
                    eth0\t00000000\t0102000A\t0003\t0\t0\t100\t00000000\n\
                    eth0\t0002000A\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";
        let routes = parse_route_table(text);
        assert_eq!(routes.get("eth0"), Some(&Ipv4Addr::new(10, 0, 2, 1)));
    }

    #[test]
    fn virtual_interfaces_are_skipped() {
        let up = InterfaceFlags::IFF_UP | InterfaceFlags::IFF_RUNNING;
        assert!(skip_interface("veth12ab", up));
        assert!(skip_interface("br-qemu0", up));
        assert!(skip_interface("eth0", InterfaceFlags::empty()));
        assert!(!skip_interface("eth0", up));
        assert!(skip_interface("lo", up | InterfaceFlags::IFF_LOOPBACK));
    }

    #[test]
    fn zero_mac_renders_empty() {
        assert_eq!(format_mac(&[0, 0, 0, 0, 0, 0]), "");
        assert_eq!(format_mac(&[0x52, 0x54, 0x00, 0x12, 0x34, 0x56]), "52:54:00:12:34:56");
    }
}
