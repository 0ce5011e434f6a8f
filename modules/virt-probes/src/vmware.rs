//! Guest inventory from vCenter / ESXi hosts. Every TLS endpoint already in
//! the store is tried as a vSphere Automation API server; powered-on guests
//! become machines matched by MAC or IP against the NICs we know.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use regex::Regex;
use serde::Deserialize;
use situation_core::{Config, Module, ModuleError, ScanContext};
use situation_store::{ApplicationEndpoint, Disk, DiskController, DiskType, Machine};
use tracing::{debug, info, warn};

/// Lists virtual machines of reachable vCenter/ESXi servers and reconciles
/// them with machines seen on the network. Needs valid API credentials,
/// without them every endpoint is just a failed login.
pub struct VMwareModule;

#[async_trait]
impl Module for VMwareModule {
    fn name(&self) -> &'static str {
        "vmware"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["docker"]
    }

    fn bind(&self, config: &mut Config) {
        config.define("vmware.username", "root", "vSphere API username");
        config.define("vmware.password", "", "vSphere API password");
        config.define("vmware.timeout", 4000, "API request timeout in milliseconds");
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let username = ctx.config.get_string("vmware.username")?;
        let password = ctx.config.get_string("vmware.password")?;
        let timeout = Duration::from_millis(ctx.config.get("vmware.timeout")?);

        for ep in ctx.store.endpoints_with_tls()? {
            let Ok(addr) = ep.addr.parse::<IpAddr>() else { continue };
            if addr.is_unspecified() {
                continue;
            }
            let client = match VcClient::login(addr, ep.port, &username, &password, timeout).await {
                Ok(client) => client,
                // most TLS endpoints are not vSphere servers
                Err(e) => {
                    debug!(ip = %addr, port = ep.port, error = %e, "not a vSphere endpoint");
                    continue;
                }
            };
            if let Err(e) = sync_vcenter(ctx, &ep, &client).await {
                warn!(ip = %addr, port = ep.port, error = %e, "vSphere sync failed");
            }
        }
        Ok(())
    }
}

async fn sync_vcenter(ctx: &ScanContext, ep: &ApplicationEndpoint, client: &VcClient) -> Result<()> {
    // the machine exposing the endpoint hosts the guests
    let parent = match ep.network_interface_id {
        Some(nic_id) => ctx.store.get_nic(nic_id)?.machine_id,
        None => None,
    };

    let vms: Vec<VmSummary> = client.get("/api/vcenter/vm").await?;
    info!(server = %client.base, vms = vms.len(), "virtual machines listed");

    for vm in &vms {
        if vm.power_state != "POWERED_ON" {
            debug!(vm = %vm.name, "not powered on, skipping");
            continue;
        }
        if let Err(e) = sync_vm(ctx, parent, client, vm).await {
            debug!(vm = %vm.name, error = %e, "guest skipped");
        }
    }
    Ok(())
}

async fn sync_vm(
    ctx: &ScanContext,
    parent: Option<situation_store::MachineId>,
    client: &VcClient,
    vm: &VmSummary,
) -> Result<()> {
    let detail: VmDetail = client.get(&format!("/api/vcenter/vm/{}", vm.vm)).await?;
    // identity and networking need guest tools inside the VM
    let identity: GuestIdentity = client
        .get(&format!("/api/vcenter/vm/{}/guest/identity", vm.vm))
        .await
        .context("no guest identity, tools not running")?;
    let interfaces: Vec<GuestInterface> = client
        .get(&format!("/api/vcenter/vm/{}/guest/networking/interfaces", vm.vm))
        .await
        .unwrap_or_default();
    let routes: Vec<GuestRoute> = client
        .get(&format!("/api/vcenter/vm/{}/guest/networking/routes", vm.vm))
        .await
        .unwrap_or_default();

    if interfaces.is_empty() {
        bail!("guest reports no network interface");
    }

    let mut machine = match find_machine(ctx, &interfaces)? {
        Some(m) => m,
        None => {
            let id = ctx.store.new_empty_machine()?;
            ctx.store.get_machine(id)?
        }
    };

    machine.chassis = "vm".to_string();
    machine.parent_machine_id = parent;
    let full_name = identity
        .full_name
        .as_ref()
        .map(|m| m.default_message.as_str())
        .unwrap_or("");
    if machine.arch.is_empty() && full_name.contains("64-bit") {
        machine.arch = "x86_64".to_string();
    }
    if machine.hostname.is_empty() {
        machine.hostname = identity.host_name.clone();
    }
    machine.platform = identity.family.to_lowercase();
    machine.distribution = strip_parenthetical(full_name);
    ctx.store.update_machine(&machine)?;
    info!(
        hostname = %machine.hostname,
        platform = %machine.platform,
        distribution = %machine.distribution,
        arch = %machine.arch,
        "VM detected"
    );

    ctx.store.upsert_cpu(machine.id, "", "", detail.cpu.count)?;

    for disk in detail.disks.values() {
        ctx.store.upsert_disk(&Disk {
            id: 0,
            machine_id: machine.id,
            name: disk.label.clone(),
            size: disk.capacity,
            disk_type: backing_disk_type(
                disk.backing.as_ref().map(|b| b.kind.as_str()).unwrap_or(""),
            ),
            controller: bus_controller(&disk.bus),
            partitions: Vec::new(),
        })?;
    }

    for iface in &interfaces {
        sync_nic(ctx, machine.id, iface, &routes)?;
    }
    Ok(())
}

/// First NIC that matches by MAC, then by IP, wins.
fn find_machine(ctx: &ScanContext, interfaces: &[GuestInterface]) -> Result<Option<Machine>> {
    for iface in interfaces {
        if !iface.mac_address.is_empty() {
            if let Some(nic) = ctx.store.nic_by_mac(&iface.mac_address.to_uppercase())? {
                if let Some(id) = nic.machine_id {
                    return Ok(Some(ctx.store.get_machine(id)?));
                }
            }
        }
        for ip in iface.addresses() {
            if let Some(nic) = ctx.store.nic_by_ip(&ip.to_string())? {
                if let Some(id) = nic.machine_id {
                    return Ok(Some(ctx.store.get_machine(id)?));
                }
            }
        }
    }
    Ok(None)
}

fn sync_nic(
    ctx: &ScanContext,
    machine_id: situation_store::MachineId,
    iface: &GuestInterface,
    routes: &[GuestRoute],
) -> Result<()> {
    let addresses = iface.addresses();
    let mut nic = if iface.mac_address.is_empty() {
        None
    } else {
        ctx.store.nic_by_mac(&iface.mac_address.to_uppercase())?
    };
    if nic.is_none() {
        if let Some(ip) = addresses.first() {
            nic = ctx.store.nic_by_ip(&ip.to_string())?;
        }
    }
    let mut nic = nic.unwrap_or_default();
    nic.machine_id = Some(machine_id);
    nic.mac = iface.mac_address.to_uppercase();
    nic.ips = iface
        .ip
        .as_ref()
        .map(|cfg| {
            cfg.ip_addresses
                .iter()
                .map(|a| format!("{}/{}", a.ip_address, a.prefix_length))
                .collect()
        })
        .unwrap_or_default();
    if let Some(gw) = gateway_for(&addresses, routes) {
        nic.gateway = gw;
    }
    ctx.store.upsert_nic(&mut nic)?;
    Ok(())
}

/// Gateway of the first route whose destination network contains one of
/// the NIC addresses. The default route matches everything, as in the
/// guest routing table itself.
fn gateway_for(addresses: &[IpAddr], routes: &[GuestRoute]) -> Option<String> {
    for route in routes {
        if route.gateway_address.is_empty() {
            continue;
        }
        let Ok(dest) = route.network.parse::<IpAddr>() else { continue };
        let Ok(net) = IpNet::new(dest, route.prefix_length) else { continue };
        if addresses.iter().any(|ip| net.contains(ip)) {
            return Some(route.gateway_address.clone());
        }
    }
    None
}

fn strip_parenthetical(name: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\s*\(.*\)").unwrap());
    re.replace_all(name, "").trim().to_string()
}

fn backing_disk_type(kind: &str) -> DiskType {
    match kind.to_ascii_lowercase().as_str() {
        "vmdk_file" | "flat_ver2" => DiskType::Vmdk,
        "raw_disk_mapping_ver1" | "raw_disk_ver2" => DiskType::Raw,
        "sparse_ver2" => DiskType::Sparse,
        "flat_ver1" => DiskType::Flat,
        "se_sparse" => DiskType::SeSparse,
        "local_pmem" => DiskType::Pmem,
        "partitioned_raw_disk_ver2" => DiskType::PartitionedRaw,
        "sparse_ver1" => DiskType::SparseV1,
        _ => DiskType::Unknown,
    }
}

fn bus_controller(bus: &str) -> DiskController {
    match bus {
        "SCSI" => DiskController::Scsi,
        "IDE" => DiskController::Ide,
        "NVME" => DiskController::Nvme,
        _ => DiskController::Unknown,
    }
}

/// Authenticated vSphere Automation API session.
struct VcClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl VcClient {
    async fn login(
        addr: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let base = match addr {
            IpAddr::V4(v4) => format!("https://{v4}:{port}"),
            IpAddr::V6(v6) => format!("https://[{v6}]:{port}"),
        };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        let resp = http
            .post(format!("{base}/api/session"))
            .basic_auth(username, Some(password))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("session creation refused: {}", resp.status());
        }
        let token: String = resp.json().await.context("session token decode")?;
        Ok(Self { http, base, token })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base))
            .header("vmware-api-session-id", &self.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("GET {path}: {}", resp.status());
        }
        Ok(resp.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
    #[serde(default)]
    power_state: String,
}

#[derive(Debug, Deserialize)]
struct VmDetail {
    cpu: CpuInfo,
    #[serde(default)]
    disks: HashMap<String, DiskInfo>,
}

#[derive(Debug, Deserialize)]
struct CpuInfo {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct DiskInfo {
    #[serde(default)]
    label: String,
    #[serde(default)]
    capacity: i64,
    #[serde(rename = "type", default)]
    bus: String,
    backing: Option<DiskBacking>,
}

#[derive(Debug, Deserialize)]
struct DiskBacking {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct GuestIdentity {
    #[serde(default)]
    family: String,
    full_name: Option<LocalizableMessage>,
    #[serde(default)]
    host_name: String,
}

#[derive(Debug, Deserialize)]
struct LocalizableMessage {
    #[serde(default)]
    default_message: String,
}

#[derive(Debug, Deserialize)]
struct GuestInterface {
    #[serde(default)]
    mac_address: String,
    ip: Option<GuestIpConfig>,
}

impl GuestInterface {
    fn addresses(&self) -> Vec<IpAddr> {
        self.ip
            .as_ref()
            .map(|cfg| {
                cfg.ip_addresses
                    .iter()
                    .filter_map(|a| a.ip_address.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct GuestIpConfig {
    #[serde(default)]
    ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Debug, Deserialize)]
struct GuestIpAddress {
    ip_address: String,
    #[serde(default)]
    prefix_length: u8,
}

#[derive(Debug, Deserialize)]
struct GuestRoute {
    #[serde(default)]
    network: String,
    #[serde(default)]
    prefix_length: u8,
    #[serde(default)]
    gateway_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backing_classes_map_to_disk_types() {
        assert_eq!(backing_disk_type("VMDK_FILE"), DiskType::Vmdk);
        assert_eq!(backing_disk_type("flat_ver2"), DiskType::Vmdk);
        assert_eq!(backing_disk_type("raw_disk_mapping_ver1"), DiskType::Raw);
        assert_eq!(backing_disk_type("raw_disk_ver2"), DiskType::Raw);
        assert_eq!(backing_disk_type("sparse_ver2"), DiskType::Sparse);
        assert_eq!(backing_disk_type("flat_ver1"), DiskType::Flat);
        assert_eq!(backing_disk_type("se_sparse"), DiskType::SeSparse);
        assert_eq!(backing_disk_type("local_pmem"), DiskType::Pmem);
        assert_eq!(backing_disk_type("partitioned_raw_disk_ver2"), DiskType::PartitionedRaw);
        assert_eq!(backing_disk_type("sparse_ver1"), DiskType::SparseV1);
        assert_eq!(backing_disk_type(""), DiskType::Unknown);
    }

    #[test]
    fn distribution_drops_the_parenthetical() {
        assert_eq!(
            strip_parenthetical("Ubuntu Linux (64-bit)"),
            "Ubuntu Linux"
        );
        assert_eq!(
            strip_parenthetical("Microsoft Windows Server 2022 (64-bit)"),
            "Microsoft Windows Server 2022"
        );
        assert_eq!(strip_parenthetical("FreeBSD 13"), "FreeBSD 13");
    }

    #[test]
    fn gateway_matches_the_covering_route() {
        let routes = vec![
            GuestRoute {
                network: "10.0.0.0".to_string(),
                prefix_length: 24,
                gateway_address: "10.0.0.1".to_string(),
            },
            GuestRoute {
                network: "0.0.0.0".to_string(),
                prefix_length: 0,
                gateway_address: "192.168.1.254".to_string(),
            },
        ];
        let lan: Vec<IpAddr> = vec!["10.0.0.42".parse().unwrap()];
        assert_eq!(gateway_for(&lan, &routes), Some("10.0.0.1".to_string()));
        let other: Vec<IpAddr> = vec!["172.16.0.9".parse().unwrap()];
        assert_eq!(gateway_for(&other, &routes), Some("192.168.1.254".to_string()));
        assert_eq!(gateway_for(&[], &routes), None);
    }

    #[test]
    fn guest_payloads_decode() {
        let identity: GuestIdentity = serde_json::from_str(
            r#"{"family":"LINUX","full_name":{"default_message":"Ubuntu Linux (64-bit)",
                "id":"vmsg","args":[]},"host_name":"web-1","ip_address":"10.0.0.42"}"#,
        )
        .unwrap();
        assert_eq!(identity.family, "LINUX");
        assert_eq!(identity.host_name, "web-1");
        assert!(identity.full_name.unwrap().default_message.contains("64-bit"));

        let ifaces: Vec<GuestInterface> = serde_json::from_str(
            r#"[{"mac_address":"00:50:56:aa:bb:cc",
                 "ip":{"ip_addresses":[{"ip_address":"10.0.0.42","prefix_length":24,
                                        "state":"PREFERRED"}]}}]"#,
        )
        .unwrap();
        assert_eq!(ifaces[0].addresses(), vec!["10.0.0.42".parse::<IpAddr>().unwrap()]);

        let detail: VmDetail = serde_json::from_str(
            r#"{"cpu":{"count":4,"hot_add_enabled":false},
                "disks":{"2000":{"label":"Hard disk 1","capacity":34359738368,
                                 "type":"SCSI","backing":{"type":"VMDK_FILE",
                                 "vmdk_file":"[ds] web-1/web-1.vmdk"}}}}"#,
        )
        .unwrap();
        assert_eq!(detail.cpu.count, 4);
        let disk = &detail.disks["2000"];
        assert_eq!(disk.label, "Hard disk 1");
        assert_eq!(backing_disk_type(&disk.backing.as_ref().unwrap().kind), DiskType::Vmdk);
        assert_eq!(bus_controller(&disk.bus), DiskController::Scsi);
    }
}
