use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use nix::unistd::Uid;
use situation_core::{Module, ModuleError, ScanContext};
use situation_store::{
    strip_prefix_len, Application, ApplicationEndpoint, ApplicationId, EndpointId, Flow, NicId,
    Protocol,
};
use tracing::{info, warn};

use crate::procnet::{self, ProcessInfo, SockEntry, TCP_LISTEN};

const TABLES: &[(&str, Protocol)] = &[
    ("/proc/net/tcp", Protocol::Tcp),
    ("/proc/net/udp", Protocol::Udp),
    ("/proc/net/tcp6", Protocol::Tcp6),
    ("/proc/net/udp6", Protocol::Udp6),
];

/// Source ports at or above this value are ephemeral, which marks the local
/// side of a UDP exchange as the initiator.
const EPHEMERAL_START: u16 = 49152;

/// Enumerates the kernel socket tables to discover listening endpoints, the
/// applications behind them and the flows between them.
///
/// On Linux the module needs root: without access to every `/proc/<pid>/fd`
/// there is no reliable link between an open port and a program.
pub struct NetstatModule;

#[async_trait]
impl Module for NetstatModule {
    fn name(&self) -> &'static str {
        "netstat"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["local-users", "tcp-scan"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        if cfg!(target_os = "linux") && !Uid::effective().is_root() {
            return Err(ModuleError::missing_privilege(
                "reading /proc/<pid>/fd requires root",
            ));
        }
        let host = ctx.store.get_or_create_host()?;

        let mut entries: Vec<SockEntry> = Vec::new();
        for (path, protocol) in TABLES {
            match std::fs::read_to_string(path) {
                Ok(text) => entries.extend(procnet::parse_table(&text, *protocol)),
                Err(e) => warn!(table = *path, error = %e, "socket table unreadable"),
            }
        }
        let processes = procnet::socket_processes();

        // local IP -> NICs, with the wildcards expanded to every NIC
        let local_nics = ctx.store.nics_by_machine(host.id)?;
        let mut local_index: HashMap<String, Vec<NicId>> = HashMap::new();
        let mut nic_ips: HashMap<NicId, Vec<String>> = HashMap::new();
        for nic in &local_nics {
            for raw in &nic.ips {
                let ip = strip_prefix_len(raw).to_string();
                local_index.entry(ip.clone()).or_default().push(nic.id);
                nic_ips.entry(nic.id).or_default().push(ip);
            }
            for wildcard in ["0.0.0.0", "::"] {
                local_index.entry(wildcard.into()).or_default().push(nic.id);
            }
        }

        // remote IP -> NIC for addresses already known to belong to neighbours
        let mut remote_index: HashMap<String, NicId> = HashMap::new();
        for entry in &entries {
            for ip in [entry.local_ip, entry.remote_ip] {
                let key = ip.to_string();
                if ip.is_unspecified()
                    || local_index.contains_key(&key)
                    || remote_index.contains_key(&key)
                {
                    continue;
                }
                if let Some(nic) = ctx.store.nic_by_ip(&key)? {
                    remote_index.insert(key, nic.id);
                }
            }
        }

        let collected = collect(
            &entries,
            &processes,
            &local_index,
            &nic_ips,
            &remote_index,
            std::process::id() as i64,
        );

        // applications first so that endpoints and user links can reference them
        let mut apps: Vec<Application> = collected
            .apps
            .values()
            .map(|p| Application {
                id: 0,
                machine_id: host.id,
                package_id: None,
                name: p.name.clone(),
                args: p.args.clone(),
                pid: p.pid,
                version: String::new(),
                protocol: String::new(),
                cpe: String::new(),
                config: Default::default(),
            })
            .collect();
        apps.sort_by(|a, b| (&a.name, a.pid).cmp(&(&b.name, b.pid)));
        ctx.store.bulk_upsert_applications(&mut apps)?;
        let app_ids: HashMap<AppKey, ApplicationId> = apps
            .iter()
            .map(|a| ((a.name.clone(), a.pid), a.id))
            .collect();

        let users: HashMap<String, i64> = ctx
            .store
            .users_by_machine(host.id)?
            .into_iter()
            .map(|u| (u.uid, u.id))
            .collect();
        for ((_, uid), key) in &collected.user_apps {
            if let (Some(app), Some(user)) = (app_ids.get(key), users.get(uid)) {
                ctx.store.link_user_application(*user, *app)?;
            }
        }

        let keys: Vec<EpKey> = collected.endpoints.keys().cloned().collect();
        let mut endpoints: Vec<ApplicationEndpoint> = keys
            .iter()
            .map(|k| {
                let p = &collected.endpoints[k];
                ApplicationEndpoint {
                    id: 0,
                    application_id: p.app.as_ref().and_then(|k| app_ids.get(k)).copied(),
                    network_interface_id: p.nic,
                    addr: p.addr.clone(),
                    port: p.port,
                    protocol: p.protocol,
                    application_protocols: None,
                    saas: None,
                    tls: None,
                    fingerprints: None,
                }
            })
            .collect();
        ctx.store.bulk_upsert_endpoints(&mut endpoints)?;
        let ep_ids: HashMap<EpKey, EndpointId> = keys
            .into_iter()
            .zip(endpoints.iter().map(|e| e.id))
            .collect();

        let mut seen = HashSet::new();
        let mut flows: Vec<Flow> = Vec::new();
        for f in &collected.flows {
            let Some(dst) = ep_ids.get(&f.dst).copied() else {
                continue;
            };
            let src_app = f.src_app.as_ref().and_then(|k| app_ids.get(k)).copied();
            if !seen.insert((src_app, f.src_addr.clone(), dst)) {
                continue;
            }
            flows.push(Flow {
                id: 0,
                src_application_id: src_app,
                src_network_interface_id: f.src_nic,
                src_addr: f.src_addr.clone(),
                dst_endpoint_id: dst,
                state: String::new(),
            });
        }
        ctx.store.bulk_upsert_flows(&mut flows)?;

        info!(
            applications = apps.len(),
            endpoints = endpoints.len(),
            flows = flows.len(),
            "socket tables absorbed"
        );
        Ok(())
    }
}

type AppKey = (String, i64);
type EpKey = (String, u16, &'static str);

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEndpoint {
    addr: String,
    port: u16,
    protocol: Protocol,
    nic: Option<NicId>,
    app: Option<AppKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingFlow {
    src_app: Option<AppKey>,
    src_nic: Option<NicId>,
    src_addr: String,
    dst: EpKey,
}

#[derive(Debug, Default)]
struct Collected {
    apps: HashMap<AppKey, ProcessInfo>,
    /// keyed by (pid, uid)
    user_apps: HashMap<(i64, String), AppKey>,
    endpoints: HashMap<EpKey, PendingEndpoint>,
    flows: Vec<PendingFlow>,
    listening: HashSet<(String, u16)>,
}

impl Collected {
    fn intern_app(&mut self, p: &ProcessInfo, uid: u32) -> AppKey {
        let key = (p.name.clone(), p.pid);
        self.apps.entry(key.clone()).or_insert_with(|| p.clone());
        self.user_apps
            .entry((p.pid, uid.to_string()))
            .or_insert_with(|| key.clone());
        key
    }

    fn intern_endpoint(
        &mut self,
        addr: String,
        port: u16,
        protocol: Protocol,
        nic: Option<NicId>,
        app: Option<AppKey>,
    ) -> EpKey {
        let key = (addr.clone(), port, protocol.as_str());
        let ep = self.endpoints.entry(key.clone()).or_insert(PendingEndpoint {
            addr,
            port,
            protocol,
            nic,
            app: None,
        });
        if ep.app.is_none() {
            ep.app = app;
        }
        if ep.nic.is_none() {
            ep.nic = nic;
        }
        key
    }
}

fn is_listening(e: &SockEntry) -> bool {
    match e.protocol {
        Protocol::Tcp | Protocol::Tcp6 => e.state == TCP_LISTEN,
        // an unconnected UDP socket waits for datagrams
        Protocol::Udp | Protocol::Udp6 => e.remote_port == 0 && e.remote_ip.is_unspecified(),
    }
}

fn is_incoming(e: &SockEntry, listening: &HashSet<(String, u16)>) -> bool {
    let local = (e.local_ip.to_string(), e.local_port);
    match e.protocol {
        Protocol::Tcp | Protocol::Tcp6 => listening.contains(&local),
        Protocol::Udp | Protocol::Udp6 => {
            listening.contains(&local) || e.local_port < EPHEMERAL_START
        }
    }
}

/// Two passes over the socket tables. The first materialises listening
/// endpoints (a wildcard bind becomes one endpoint per NIC) and records the
/// listening addresses; the second classifies every connected socket as an
/// incoming or outgoing flow against that set.
fn collect(
    entries: &[SockEntry],
    processes: &HashMap<u64, ProcessInfo>,
    local_index: &HashMap<String, Vec<NicId>>,
    nic_ips: &HashMap<NicId, Vec<String>>,
    remote_index: &HashMap<String, NicId>,
    own_pid: i64,
) -> Collected {
    let mut c = Collected::default();

    for e in entries.iter().filter(|e| is_listening(e)) {
        let local = e.local_ip.to_string();
        let Some(nics) = local_index.get(&local) else {
            continue;
        };
        c.listening.insert((local.clone(), e.local_port));
        let app = processes.get(&e.inode).map(|p| c.intern_app(p, e.uid));
        for nic in nics {
            let addrs: Vec<String> = if e.local_ip.is_unspecified() {
                nic_ips.get(nic).cloned().unwrap_or_default()
            } else {
                vec![local.clone()]
            };
            for addr in addrs {
                c.listening.insert((addr.clone(), e.local_port));
                c.intern_endpoint(addr, e.local_port, e.protocol, Some(*nic), app.clone());
            }
        }
    }

    for e in entries.iter().filter(|e| procnet::is_flow_state(e.state)) {
        let Some(proc) = processes.get(&e.inode) else {
            continue;
        };
        if proc.pid == own_pid {
            continue;
        }
        let local = e.local_ip.to_string();
        let remote = e.remote_ip.to_string();
        let app = c.intern_app(proc, e.uid);
        let Some(nics) = local_index.get(&local) else {
            continue;
        };
        if is_incoming(e, &c.listening) {
            // the remote peer initiated; the local application is the destination
            for nic in nics.clone() {
                let dst = c.intern_endpoint(
                    local.clone(),
                    e.local_port,
                    e.protocol,
                    Some(nic),
                    Some(app.clone()),
                );
                c.flows.push(PendingFlow {
                    src_app: None,
                    src_nic: remote_index.get(&remote).copied(),
                    src_addr: remote.clone(),
                    dst,
                });
            }
        } else {
            // the remote endpoint may belong to a machine we already know
            for nic in nics.clone() {
                let dst = c.intern_endpoint(
                    remote.clone(),
                    e.remote_port,
                    e.protocol,
                    remote_index.get(&remote).copied(),
                    None,
                );
                c.flows.push(PendingFlow {
                    src_app: Some(app.clone()),
                    src_nic: Some(nic),
                    src_addr: local.clone(),
                    dst,
                });
            }
        }
    }

    c
}
