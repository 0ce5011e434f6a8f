use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use situation_core::{join_errors, run_pool, Config, Module, ModuleError, ScanContext};
use situation_store::{
    strip_prefix_len, ApplicationEndpoint, MachineId, NetworkInterface, NicFlags, Protocol,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::ber::{self, Value, VarBind};

const IF_DESCR: &[u32] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 2];
const IF_PHYS_ADDRESS: &[u32] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 6];
const IF_NAME: &[u32] = &[1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 1];
const IP_AD_ENT_IF_INDEX: &[u32] = &[1, 3, 6, 1, 2, 1, 4, 20, 1, 2];
const IP_AD_ENT_NET_MASK: &[u32] = &[1, 3, 6, 1, 2, 1, 4, 20, 1, 3];
const IP_ADDRESS_IF_INDEX: &[u32] = &[1, 3, 6, 1, 2, 1, 4, 34, 1, 3];
const INET_CIDR_ROUTE_IF_INDEX: &[u32] = &[1, 3, 6, 1, 2, 1, 4, 24, 7, 1, 7];
const INET_CIDR_ROUTE_TYPE: &[u32] = &[1, 3, 6, 1, 2, 1, 4, 24, 7, 1, 8];
const IP_FORWARD_NEXT_HOP: &[u32] = &[1, 3, 6, 1, 2, 1, 4, 24, 2, 1, 4];
const IP_FORWARD_IF_INDEX: &[u32] = &[1, 3, 6, 1, 2, 1, 4, 24, 2, 1, 5];
const IP_FORWARD_TYPE: &[u32] = &[1, 3, 6, 1, 2, 1, 4, 24, 2, 1, 6];

/// inetCidrRouteType / ipForwardType "remote": traffic leaves via a next hop.
const ROUTE_TYPE_REMOTE: i64 = 4;

/// Walks the MIB-2 interface, address and route tables of every neighbour
/// and folds the answers into that machine's NICs. A responding agent also
/// gets a udp/161 endpoint as evidence.
pub struct SnmpModule;

#[derive(Clone)]
struct Params {
    community: String,
    port: u16,
    timeout: Duration,
    retries: u32,
}

#[async_trait]
impl Module for SnmpModule {
    fn name(&self) -> &'static str {
        "snmp"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["reverse-lookup"]
    }

    fn bind(&self, config: &mut Config) {
        config.define("snmp.version", "2c", "SNMP version to use");
        config.define("snmp.community", "public", "SNMP community to query");
        config.define("snmp.timeout", 1000, "SNMP query timeout in milliseconds");
        config.define("snmp.transport", "udp", "transport protocol");
        config.define("snmp.port", 161, "port to connect");
        config.define("snmp.retries", 2, "resend attempts per request");
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let version = ctx.config.get_string("snmp.version")?;
        if version != "2c" {
            return Err(anyhow!("unsupported SNMP version {version:?}, only 2c is implemented").into());
        }
        let transport = ctx.config.get_string("snmp.transport")?;
        if transport != "udp" {
            return Err(anyhow!("unsupported SNMP transport {transport:?}").into());
        }
        let params = Params {
            community: ctx.config.get_string("snmp.community")?,
            port: ctx.config.get("snmp.port")?,
            timeout: Duration::from_millis(ctx.config.get("snmp.timeout")?),
            retries: ctx.config.get("snmp.retries")?,
        };

        let host = ctx.store.get_or_create_host()?;
        let mut targets: Vec<(MachineId, IpAddr)> = Vec::new();
        for machine in ctx.store.all_machines()? {
            if machine.id == host.id {
                continue;
            }
            for nic in ctx.store.nics_by_machine(machine.id)? {
                for raw in &nic.ips {
                    let Ok(ip) = strip_prefix_len(raw).parse::<IpAddr>() else { continue };
                    if ip.is_loopback() || ip.is_multicast() {
                        continue;
                    }
                    targets.push((machine.id, ip));
                }
            }
        }
        if targets.is_empty() {
            return Ok(());
        }
        info!(targets = targets.len(), "querying SNMP agents");

        // one task per target
        let width = targets.len();
        let results = Arc::new(Mutex::new(Vec::<(MachineId, IpAddr, Tables)>::new()));
        let sink = results.clone();
        let shared = params.clone();
        let errors = run_pool(width, targets, move |(machine_id, ip)| {
            let sink = sink.clone();
            let params = shared.clone();
            async move {
                if let Some(tables) = probe(ip, &params).await? {
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((machine_id, ip, tables));
                }
                Ok(())
            }
        })
        .await;

        let found = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
        for (machine_id, ip, tables) in found {
            apply(ctx, machine_id, ip, params.port, &tables)?;
        }
        match join_errors(errors) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Opens a session and walks every table we care about. `Ok(None)` means the
/// target simply does not speak SNMP.
async fn probe(target: IpAddr, params: &Params) -> Result<Option<Tables>> {
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let sock = UdpSocket::bind(bind).await?;
    sock.connect((target, params.port)).await?;
    let mut session = Session {
        sock,
        community: params.community.clone(),
        timeout: params.timeout,
        retries: params.retries,
        next_id: rand::random::<u16>() as i64,
    };

    // any decodable answer, even an error one, proves an agent is there
    if session.request(&[0, 0], false).await.is_err() {
        return Ok(None);
    }
    debug!(target = %target, "SNMP agent responding");

    let tables = Tables {
        descrs: session.walk(IF_DESCR).await?,
        names: session.walk(IF_NAME).await.unwrap_or_default(),
        macs: session.walk(IF_PHYS_ADDRESS).await?,
        legacy_addrs: session.walk(IP_AD_ENT_IF_INDEX).await.unwrap_or_default(),
        legacy_masks: session.walk(IP_AD_ENT_NET_MASK).await.unwrap_or_default(),
        modern_addrs: session.walk(IP_ADDRESS_IF_INDEX).await.unwrap_or_default(),
        route_if: session.walk(INET_CIDR_ROUTE_IF_INDEX).await.unwrap_or_default(),
        route_type: session.walk(INET_CIDR_ROUTE_TYPE).await.unwrap_or_default(),
        fwd_next_hop: session.walk(IP_FORWARD_NEXT_HOP).await.unwrap_or_default(),
        fwd_if: session.walk(IP_FORWARD_IF_INDEX).await.unwrap_or_default(),
        fwd_type: session.walk(IP_FORWARD_TYPE).await.unwrap_or_default(),
    };
    Ok(Some(tables))
}

fn apply(
    ctx: &ScanContext,
    machine_id: MachineId,
    ip: IpAddr,
    port: u16,
    tables: &Tables,
) -> Result<()> {
    let ifaces = assemble(tables);

    if let Some(nic) = ctx.store.nic_by_ip(&ip.to_string())? {
        let mut ep = ApplicationEndpoint {
            id: 0,
            application_id: None,
            network_interface_id: Some(nic.id),
            addr: ip.to_string(),
            port,
            protocol: if ip.is_ipv4() { Protocol::Udp } else { Protocol::Udp6 },
            application_protocols: Some(vec!["snmp".into()]),
            saas: None,
            tls: None,
            fingerprints: None,
        };
        ctx.store.upsert_endpoint(&mut ep)?;
    }

    let existing = ctx.store.nics_by_machine(machine_id)?;
    for iface in ifaces {
        let mut nic = NetworkInterface {
            id: 0,
            machine_id: Some(machine_id),
            name: iface.name,
            mac: iface.mac,
            mac_vendor: None,
            ips: iface.ips,
            gateway: iface.gateway,
            flags: NicFlags {
                up: true,
                ..NicFlags::default()
            },
            tag: String::new(),
        };
        if let Some(known) = existing
            .iter()
            .find(|e| (!e.mac.is_empty() && e.mac == nic.mac) || (!e.name.is_empty() && e.name == nic.name))
        {
            nic.name = known.name.clone();
        }
        ctx.store.upsert_nic(&mut nic)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Tables {
    descrs: Vec<VarBind>,
    names: Vec<VarBind>,
    macs: Vec<VarBind>,
    legacy_addrs: Vec<VarBind>,
    legacy_masks: Vec<VarBind>,
    modern_addrs: Vec<VarBind>,
    route_if: Vec<VarBind>,
    route_type: Vec<VarBind>,
    fwd_next_hop: Vec<VarBind>,
    fwd_if: Vec<VarBind>,
    fwd_type: Vec<VarBind>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct SnmpInterface {
    index: i64,
    name: String,
    mac: String,
    ips: Vec<String>,
    gateway: String,
}

/// One interface per ifIndex, addresses and gateway folded in. Interfaces
/// with a zero MAC or without a gateway are internal plumbing and dropped.
fn assemble(tables: &Tables) -> Vec<SnmpInterface> {
    let mut ifaces: BTreeMap<i64, SnmpInterface> = BTreeMap::new();
    let mut entry = |idx: i64, f: &mut dyn FnMut(&mut SnmpInterface)| {
        let iface = ifaces.entry(idx).or_insert_with(|| SnmpInterface {
            index: idx,
            ..SnmpInterface::default()
        });
        f(iface);
    };

    for vb in &tables.descrs {
        if let (Some(idx), Value::Bytes(b)) = (if_index(&vb.oid, IF_DESCR), &vb.value) {
            let name = String::from_utf8_lossy(b).to_string();
            entry(idx, &mut |i| i.name = name.clone());
        }
    }
    // ifName is the short form, preferred when present
    for vb in &tables.names {
        if let (Some(idx), Value::Bytes(b)) = (if_index(&vb.oid, IF_NAME), &vb.value) {
            let name = String::from_utf8_lossy(b).to_string();
            if !name.is_empty() {
                entry(idx, &mut |i| i.name = name.clone());
            }
        }
    }
    for vb in &tables.macs {
        if let (Some(idx), Value::Bytes(b)) = (if_index(&vb.oid, IF_PHYS_ADDRESS), &vb.value) {
            let mac = mac_from_bytes(b);
            entry(idx, &mut |i| i.mac = mac.clone());
        }
    }

    if !tables.legacy_addrs.is_empty() {
        let mut masks: HashMap<Vec<u32>, u8> = HashMap::new();
        for vb in &tables.legacy_masks {
            if let (Some(rest), Value::IpAddress(m)) = (suffix(&vb.oid, IP_AD_ENT_NET_MASK), &vb.value) {
                masks.insert(rest.to_vec(), m.iter().map(|o| o.count_ones() as u8).sum());
            }
        }
        for vb in &tables.legacy_addrs {
            let (Some(rest), Value::Int(idx)) = (suffix(&vb.oid, IP_AD_ENT_IF_INDEX), &vb.value)
            else {
                continue;
            };
            let Some(addr) = v4_from_arcs(rest) else { continue };
            let rendered = match masks.get(rest) {
                Some(prefix) => format!("{addr}/{prefix}"),
                None => addr.to_string(),
            };
            entry(*idx, &mut |i| i.ips.push(rendered.clone()));
        }
    } else {
        for vb in &tables.modern_addrs {
            let (Some(rest), Value::Int(idx)) = (suffix(&vb.oid, IP_ADDRESS_IF_INDEX), &vb.value)
            else {
                continue;
            };
            let Some(addr) = inet_address_from_arcs(rest) else { continue };
            let rendered = addr.to_string();
            entry(*idx, &mut |i| i.ips.push(rendered.clone()));
        }
    }

    let mut gateways: HashMap<i64, String> = HashMap::new();
    if !tables.route_if.is_empty() {
        let mut remote: HashMap<Vec<u32>, bool> = HashMap::new();
        for vb in &tables.route_type {
            if let (Some(rest), Value::Int(t)) = (suffix(&vb.oid, INET_CIDR_ROUTE_TYPE), &vb.value) {
                remote.insert(rest.to_vec(), *t == ROUTE_TYPE_REMOTE);
            }
        }
        for vb in &tables.route_if {
            let (Some(rest), Value::Int(idx)) = (suffix(&vb.oid, INET_CIDR_ROUTE_IF_INDEX), &vb.value)
            else {
                continue;
            };
            if !remote.get(rest).copied().unwrap_or(false) {
                continue;
            }
            // the next hop closes the route index: ...,type,len,addr
            let n = rest.len();
            if n >= 6 && rest[n - 6] == 1 && rest[n - 5] == 4 {
                if let Some(gw) = v4_from_arcs(&rest[n - 4..]) {
                    gateways.entry(*idx).or_insert_with(|| gw.to_string());
                }
            }
        }
    } else {
        let mut hops: HashMap<Vec<u32>, Ipv4Addr> = HashMap::new();
        for vb in &tables.fwd_next_hop {
            if let (Some(rest), Value::IpAddress(o)) = (suffix(&vb.oid, IP_FORWARD_NEXT_HOP), &vb.value) {
                hops.insert(rest.to_vec(), Ipv4Addr::from(*o));
            }
        }
        let mut indices: HashMap<Vec<u32>, i64> = HashMap::new();
        for vb in &tables.fwd_if {
            if let (Some(rest), Value::Int(idx)) = (suffix(&vb.oid, IP_FORWARD_IF_INDEX), &vb.value) {
                indices.insert(rest.to_vec(), *idx);
            }
        }
        for vb in &tables.fwd_type {
            let (Some(rest), Value::Int(t)) = (suffix(&vb.oid, IP_FORWARD_TYPE), &vb.value) else {
                continue;
            };
            if *t != ROUTE_TYPE_REMOTE {
                continue;
            }
            if let (Some(idx), Some(gw)) = (indices.get(rest), hops.get(rest)) {
                gateways.entry(*idx).or_insert_with(|| gw.to_string());
            }
        }
    }
    for (idx, gw) in gateways {
        entry(idx, &mut |i| i.gateway = gw.clone());
    }

    ifaces
        .into_values()
        .filter(|i| !i.mac.is_empty() && !i.mac.starts_with("00:00:00"))
        .filter(|i| !i.gateway.is_empty())
        .collect()
}

fn if_index(oid: &[u32], base: &[u32]) -> Option<i64> {
    let rest = suffix(oid, base)?;
    (rest.len() == 1).then(|| i64::from(rest[0]))
}

fn suffix<'a>(oid: &'a [u32], base: &[u32]) -> Option<&'a [u32]> {
    ber::oid_starts_with(oid, base).then(|| &oid[base.len()..])
}

fn v4_from_arcs(arcs: &[u32]) -> Option<Ipv4Addr> {
    if arcs.len() != 4 || arcs.iter().any(|a| *a > 255) {
        return None;
    }
    Some(Ipv4Addr::new(arcs[0] as u8, arcs[1] as u8, arcs[2] as u8, arcs[3] as u8))
}

/// InetAddress index form: type, length, then the address bytes as arcs.
fn inet_address_from_arcs(arcs: &[u32]) -> Option<IpAddr> {
    match (arcs.first()?, arcs.get(1)?) {
        (1, 4) => v4_from_arcs(arcs.get(2..6)?).map(IpAddr::V4),
        (2 | 4, 16) => {
            let bytes = arcs.get(2..18)?;
            if bytes.iter().any(|b| *b > 255) {
                return None;
            }
            let mut buf = [0u8; 16];
            for (i, b) in bytes.iter().enumerate() {
                buf[i] = *b as u8;
            }
            Some(IpAddr::V6(Ipv6Addr::from(buf)))
        }
        _ => None,
    }
}

fn mac_from_bytes(bytes: &[u8]) -> String {
    if bytes.len() != 6 || bytes.iter().all(|b| *b == 0) {
        return String::new();
    }
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

struct Session {
    sock: UdpSocket,
    community: String,
    timeout: Duration,
    retries: u32,
    next_id: i64,
}

impl Session {
    async fn request(&mut self, oid: &[u32], next: bool) -> Result<ber::Response> {
        self.next_id += 1;
        let pkt = ber::encode_request(&self.community, self.next_id, oid, next);
        let mut buf = [0u8; 4096];
        for _ in 0..=self.retries {
            self.sock.send(&pkt).await?;
            let Ok(received) = timeout(self.timeout, self.sock.recv(&mut buf)).await else {
                continue;
            };
            let n = received?;
            let Ok(resp) = ber::decode_response(&buf[..n]) else { continue };
            if resp.request_id == self.next_id {
                return Ok(resp);
            }
        }
        Err(anyhow!("SNMP request timed out"))
    }

    /// GetNext loop over one column, stopping at the subtree boundary.
    async fn walk(&mut self, base: &[u32]) -> Result<Vec<VarBind>> {
        let mut out = Vec::new();
        let mut cursor = base.to_vec();
        loop {
            let resp = self.request(&cursor, true).await?;
            if resp.error_status != 0 {
                break;
            }
            let Some(vb) = resp.varbinds.into_iter().next() else { break };
            if vb.value == Value::EndOfMib || !ber::oid_starts_with(&vb.oid, base) {
                break;
            }
            cursor = vb.oid.clone();
            out.push(vb);
            if out.len() >= 4096 {
                break;
            }
        }
        Ok(out)
    }
}
