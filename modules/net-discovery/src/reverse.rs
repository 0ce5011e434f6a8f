use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use situation_core::{Config, Module, ModuleError, ScanContext};
use situation_store::strip_prefix_len;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

const PTR_TYPE: u16 = 12;
const ATTEMPTS: usize = 2;

/// Names machines discovered without a hostname by PTR-querying the system
/// resolver on their private-range IPs. The first answer wins.
pub struct ReverseLookupModule;

#[async_trait]
impl Module for ReverseLookupModule {
    fn name(&self) -> &'static str {
        "reverse-lookup"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["appuser"]
    }

    fn bind(&self, config: &mut Config) {
        config.define("reverse-lookup.timeout", 1000, "PTR reply timeout in milliseconds");
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let Some(server) = nameserver() else {
            return Err(ModuleError::not_applicable("no nameserver in /etc/resolv.conf"));
        };
        let wait = Duration::from_millis(ctx.config.get("reverse-lookup.timeout")?);

        for machine in ctx.store.machines_without_hostname()? {
            'machine: for nic in ctx.store.nics_by_machine(machine.id)? {
                for raw in &nic.ips {
                    let Ok(ip) = strip_prefix_len(raw).parse::<IpAddr>() else { continue };
                    if !is_private(&ip) {
                        continue;
                    }
                    for _ in 0..ATTEMPTS {
                        match query_ptr(&server, &ip, wait).await {
                            Ok(Some(name)) => {
                                debug!(machine = machine.id, ip = %ip, name = %name, "PTR answer");
                                ctx.store.set_hostname(machine.id, &name)?;
                                break 'machine;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                debug!(ip = %ip, error = %e, "PTR query failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn nameserver() -> Option<String> {
    let text = std::fs::read_to_string("/etc/resolv.conf").ok()?;
    text.lines()
        .filter_map(|l| l.trim().strip_prefix("nameserver"))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        // unique-local fc00::/7
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

async fn query_ptr(server: &str, ip: &IpAddr, wait: Duration) -> anyhow::Result<Option<String>> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    let id: u16 = rand::thread_rng().gen();
    let query = build_ptr_query(id, &ptr_name(ip));
    timeout(wait, sock.send_to(&query, (server, 53))).await??;
    let mut buf = [0u8; 512];
    let Ok(recv) = timeout(wait, sock.recv_from(&mut buf)).await else {
        return Ok(None);
    };
    let (n, _) = recv?;
    Ok(parse_ptr_response(&buf[..n], id))
}

/// `10.0.2.2` becomes `2.2.0.10.in-addr.arpa`; IPv6 uses reversed nibbles
/// under `ip6.arpa`.
fn ptr_name(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::new();
            for byte in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}

fn build_ptr_query(id: u16, name: &str) -> Vec<u8> {
    let mut q = Vec::new();
    q.extend_from_slice(&id.to_be_bytes());
    q.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    q.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    q.extend_from_slice(&0u16.to_be_bytes());
    q.extend_from_slice(&0u16.to_be_bytes());
    q.extend_from_slice(&0u16.to_be_bytes());
    for label in name.split('.') {
        q.push(label.len() as u8);
        q.extend_from_slice(label.as_bytes());
    }
    q.push(0);
    q.extend_from_slice(&PTR_TYPE.to_be_bytes());
    q.extend_from_slice(&1u16.to_be_bytes()); // IN
    q
}

/// First PTR answer of a response to query `id`, trailing dot stripped.
fn parse_ptr_response(msg: &[u8], id: u16) -> Option<String> {
    if msg.len() < 12 || u16::from_be_bytes([msg[0], msg[1]]) != id {
        return None;
    }
    if msg[2] & 0x80 == 0 {
        return None; // not a response
    }
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    let ancount = u16::from_be_bytes([msg[6], msg[7]]);
    if ancount == 0 {
        return None;
    }

    let mut pos = 12;
    for _ in 0..qdcount {
        let (_, next) = decode_name(msg, pos)?;
        pos = next + 4;
    }
    for _ in 0..ancount {
        let (_, next) = decode_name(msg, pos)?;
        pos = next;
        let rtype = u16::from_be_bytes([*msg.get(pos)?, *msg.get(pos + 1)?]);
        let rdlength = u16::from_be_bytes([*msg.get(pos + 8)?, *msg.get(pos + 9)?]) as usize;
        pos += 10;
        if rtype == PTR_TYPE {
            let (name, _) = decode_name(msg, pos)?;
            return Some(name.trim_end_matches('.').to_string());
        }
        pos += rdlength;
    }
    None
}

/// Decodes a possibly compressed domain name at `pos`. Returns the dotted
/// name and the offset right after the name in the original stream.
fn decode_name(msg: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut after = None;
    let mut hops = 0;
    loop {
        let len = *msg.get(pos)? as usize;
        if len & 0xc0 == 0xc0 {
            // compression pointer
            let target = ((len & 0x3f) << 8) | *msg.get(pos + 1)? as usize;
            if after.is_none() {
                after = Some(pos + 2);
            }
            hops += 1;
            if hops > 16 {
                return None;
            }
            pos = target;
            continue;
        }
        if len == 0 {
            pos += 1;
            break;
        }
        let label = msg.get(pos + 1..pos + 1 + len)?;
        name.push_str(std::str::from_utf8(label).ok()?);
        name.push('.');
        pos += 1 + len;
    }
    Some((name, after.unwrap_or(pos)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptr_names_reverse_the_octets() {
        let ip: IpAddr = "10.0.2.15".parse().unwrap();
        assert_eq!(ptr_name(&ip), "15.2.0.10.in-addr.arpa");
    }

    #[test]
    fn private_ranges_only() {
        assert!(is_private(&"192.168.1.4".parse().unwrap()));
        assert!(is_private(&"fd12:3456::1".parse().unwrap()));
        assert!(!is_private(&"8.8.8.8".parse().unwrap()));
        assert!(!is_private(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn ptr_answer_round_trips_with_compression() {
        let query = build_ptr_query(0x4242, "15.2.0.10.in-addr.arpa");

        // response: same question, one PTR answer whose owner name is a
        // pointer to offset 12 (the question name)
        let mut resp = query.clone();
        resp[2] = 0x81; // QR + RD
        resp[3] = 0x80; // RA
        resp[7] = 1; // ANCOUNT
        resp.extend_from_slice(&[0xc0, 12]); // owner = pointer to question
        resp.extend_from_slice(&PTR_TYPE.to_be_bytes());
        resp.extend_from_slice(&1u16.to_be_bytes());
        resp.extend_from_slice(&300u32.to_be_bytes());
        let rdata: Vec<u8> = {
            let mut v = Vec::new();
            for label in ["printer", "lan"] {
                v.push(label.len() as u8);
                v.extend_from_slice(label.as_bytes());
            }
            v.push(0);
            v
        };
        resp.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        resp.extend_from_slice(&rdata);

        assert_eq!(parse_ptr_response(&resp, 0x4242), Some("printer.lan".into()));
        // wrong transaction id is ignored
        assert_eq!(parse_ptr_response(&resp, 0x4243), None);
        // the query itself is not a response
        assert_eq!(parse_ptr_response(&query, 0x4242), None);
    }
}
