use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsFd, AsRawFd};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use situation_core::{Config, Module, ModuleError, ScanContext};
use situation_store::{NetworkInterface, NicFlags};
use tracing::{info, warn};

use crate::icmp;

/// At most this many echo requests are in flight at once.
const SWEEP_WIDTH: usize = 64;

/// Sends one echo request to every host of the local IPv4 subnetworks.
/// Responders the store does not know yet become orphan NICs linked to the
/// subnetwork; `arp` and `fingerprint` attach them to machines later.
pub struct PingModule;

#[async_trait]
impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["fingerprint"]
    }

    fn bind(&self, config: &mut Config) {
        config.define("ping.timeout", 500, "echo reply timeout in milliseconds");
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let timeout = Duration::from_millis(ctx.config.get("ping.timeout")?);
        let known: HashSet<String> = ctx.store.all_known_ips()?.into_iter().collect();

        for subnet in ctx.store.all_ipv4_networks()? {
            let Ok(net) = subnet.cidr.parse::<Ipv4Net>() else {
                warn!(cidr = %subnet.cidr, "unparsable subnetwork, skipping");
                continue;
            };
            if net.prefix_len() < 20 {
                warn!(network = %net, "network is too wide, skipping");
                continue;
            }
            let net = widen_for_sweep(&net);
            let targets: Vec<Ipv4Addr> = net
                .hosts()
                .filter(|ip| ip.octets()[3] != 0xff)
                .filter(|ip| !known.contains(&ip.to_string()))
                .collect();
            if targets.is_empty() {
                continue;
            }
            info!(network = %net, targets = targets.len(), "pinging subnetwork");

            let replies = tokio::task::spawn_blocking(move || sweep(&targets, timeout))
                .await
                .map_err(anyhow::Error::from)??;

            for ip in replies {
                if ctx.store.nic_by_ip(&ip.to_string())?.is_some() {
                    continue;
                }
                let mut nic = NetworkInterface {
                    ips: vec![ip.to_string()],
                    flags: NicFlags {
                        up: true,
                        running: true,
                        ..NicFlags::default()
                    },
                    ..NetworkInterface::default()
                };
                ctx.store.upsert_nic(&mut nic)?;
                ctx.store.link_nic_subnet(nic.id, subnet.id)?;
            }
        }
        Ok(())
    }
}

/// Prefixes tighter than /24 on non-routable bases (VPN handouts mostly) are
/// swept as the enclosing /24. The stored subnetwork keeps its real mask.
fn widen_for_sweep(net: &Ipv4Net) -> Ipv4Net {
    if net.prefix_len() > 24 && !is_public(&net.addr()) {
        Ipv4Net::new(net.addr(), 24).map(|n| n.trunc()).unwrap_or(*net)
    } else {
        *net
    }
}

fn is_public(ip: &Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast())
}

/// One shared ICMP socket for the whole sweep; separate sockets would steal
/// each other's replies. Echoes go out in windows of [`SWEEP_WIDTH`], then
/// replies are collected until the window's deadline.
fn sweep(targets: &[Ipv4Addr], timeout: Duration) -> anyhow::Result<Vec<Ipv4Addr>> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::sys::socket::{
        recvfrom, sendto, socket, AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType,
        SockaddrIn,
    };

    let mut raw = true;
    let fd = socket(
        AddressFamily::Inet,
        SockType::Raw,
        SockFlag::SOCK_NONBLOCK,
        SockProtocol::Icmp,
    )
    .or_else(|_| {
        raw = false;
        socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK,
            SockProtocol::Icmp,
        )
    })
    .map_err(|e| anyhow!("cannot open ICMP socket: {e}"))?;

    let id = (std::process::id() & 0xffff) as u16;
    let mut found = Vec::new();
    let mut buf = [0u8; 1500];

    for window in targets.chunks(SWEEP_WIDTH) {
        let mut pending: HashSet<Ipv4Addr> = window.iter().copied().collect();
        for ip in window {
            let o = ip.octets();
            let dest = SockaddrIn::new(o[0], o[1], o[2], o[3], 0);
            let pkt = icmp::echo_request(id, 1);
            let _ = sendto(fd.as_raw_fd(), &pkt, &dest, MsgFlags::empty());
        }

        let deadline = Instant::now() + timeout;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
            let timeout_ms = PollTimeout::try_from(remaining.as_millis() as i32)
                .unwrap_or(PollTimeout::NONE);
            match poll(&mut fds, timeout_ms) {
                Ok(0) => break,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(anyhow!("poll failed: {e}")),
            }
            while let Ok((n, peer)) = recvfrom::<SockaddrIn>(fd.as_raw_fd(), &mut buf) {
                let Some(peer) = peer else { continue };
                let src = *SocketAddrV4::from(peer).ip();
                if !pending.contains(&src) {
                    continue;
                }
                let Some((reply_id, seq)) = icmp::parse_echo_reply(&buf[..n]) else {
                    continue;
                };
                // datagram ICMP sockets rewrite the id on both directions
                if seq != 1 || (raw && reply_id != id) {
                    continue;
                }
                pending.remove(&src);
                found.push(src);
            }
        }
    }
    Ok(found)
}
