use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MachineId = i64;
pub type NicId = i64;
pub type SubnetId = i64;
pub type PackageId = i64;
pub type ApplicationId = i64;
pub type EndpointId = i64;
pub type UserId = i64;

/// Socket protocol. The v6 variants are distinct because the kernel exposes
/// them through distinct tables and the endpoint uniqueness tuple keys on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Tcp6,
    Udp6,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Tcp6 => "tcp6",
            Protocol::Udp6 => "udp6",
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Tcp6)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "tcp6" => Ok(Protocol::Tcp6),
            "udp6" => Ok(Protocol::Udp6),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Hdd,
    Ssd,
    Floppy,
    Optical,
    // virtual disks, named after the vmware backing class
    Vmdk,
    Raw,
    Sparse,
    Flat,
    #[serde(rename = "se_sparse")]
    SeSparse,
    Pmem,
    #[serde(rename = "partitioned_raw")]
    PartitionedRaw,
    #[serde(rename = "sparse_v1")]
    SparseV1,
    Unknown,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::Hdd => "hdd",
            DiskType::Ssd => "ssd",
            DiskType::Floppy => "floppy",
            DiskType::Optical => "optical",
            DiskType::Vmdk => "vmdk",
            DiskType::Raw => "raw",
            DiskType::Sparse => "sparse",
            DiskType::Flat => "flat",
            DiskType::SeSparse => "se_sparse",
            DiskType::Pmem => "pmem",
            DiskType::PartitionedRaw => "partitioned_raw",
            DiskType::SparseV1 => "sparse_v1",
            DiskType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskController {
    Ide,
    Mmc,
    Nvme,
    Scsi,
    Virtio,
    Unknown,
}

impl DiskController {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskController::Ide => "ide",
            DiskController::Mmc => "mmc",
            DiskController::Nvme => "nvme",
            DiskController::Scsi => "scsi",
            DiskController::Virtio => "virtio",
            DiskController::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Accept,
    Drop,
    Reject,
    Forward,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Accept => "accept",
            PolicyAction::Drop => "drop",
            PolicyAction::Reject => "reject",
            PolicyAction::Forward => "forward",
        }
    }
}

/// A host, container, VM or network neighbour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub hostname: String,
    pub host_id: String,
    pub arch: String,
    pub platform: String,
    pub distribution: String,
    pub distribution_version: String,
    pub distribution_family: String,
    /// Uptime in nanoseconds, when the probe could read it.
    pub uptime_ns: Option<i64>,
    pub chassis: String,
    pub cpe: String,
    /// Set iff this row represents the host an agent runs on.
    pub agent: Option<Uuid>,
    pub parent_machine_id: Option<MachineId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicFlags {
    pub up: bool,
    pub broadcast: bool,
    pub loopback: bool,
    pub p2p: bool,
    pub multicast: bool,
    pub running: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: NicId,
    /// None until orphan adoption assigns a stub machine.
    pub machine_id: Option<MachineId>,
    pub name: String,
    /// Upper-case `AA:BB:CC:DD:EE:FF`, possibly empty for L3-only entries.
    pub mac: String,
    pub mac_vendor: Option<String>,
    /// IPv4 and IPv6 addresses, either bare or in CIDR form.
    pub ips: Vec<String>,
    pub gateway: String,
    pub flags: NicFlags,
    pub tag: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subnetwork {
    pub id: SubnetId,
    /// Canonical CIDR, host bits cleared.
    pub cidr: String,
    pub network_addr: String,
    pub mask_size: u8,
    pub ip_version: u8,
    pub gateway: String,
    pub vlan: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cpu {
    pub id: i64,
    pub machine_id: MachineId,
    pub model: String,
    pub vendor: String,
    pub cores: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Gpu {
    pub id: i64,
    pub machine_id: MachineId,
    pub index: i64,
    pub product: String,
    pub vendor: String,
    pub driver: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub size: i64,
    pub part_type: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub id: i64,
    pub machine_id: MachineId,
    pub name: String,
    pub size: i64,
    pub disk_type: DiskType,
    pub controller: DiskController,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub machine_id: MachineId,
    pub name: String,
    pub version: String,
    pub vendor: String,
    /// One of dpkg, rpm, zypper, msi.
    pub manager: String,
    pub install_time_unix: Option<i64>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub machine_id: MachineId,
    pub package_id: Option<PackageId>,
    /// Usually the absolute path of the executable.
    pub name: String,
    pub args: String,
    pub pid: i64,
    pub version: String,
    pub protocol: String,
    pub cpe: String,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
    pub serial: String,
    pub signature_algorithm: String,
    pub public_key_algorithm: String,
    /// Colon-separated hex over the raw certificate bytes.
    pub sha1: String,
    pub sha256: String,
    pub dns_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ja4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ja4s: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ja4x: Option<String>,
}

/// A bound socket, either on a local NIC or on a remote peer seen through an
/// outgoing flow (in which case both application and NIC may be unknown).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationEndpoint {
    pub id: EndpointId,
    pub application_id: Option<ApplicationId>,
    pub network_interface_id: Option<NicId>,
    pub addr: String,
    pub port: u16,
    pub protocol: Protocol,
    pub application_protocols: Option<Vec<String>>,
    pub saas: Option<String>,
    pub tls: Option<TlsInfo>,
    pub fingerprints: Option<Fingerprints>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flow {
    pub id: i64,
    pub src_application_id: Option<ApplicationId>,
    pub src_network_interface_id: Option<NicId>,
    pub src_addr: String,
    pub dst_endpoint_id: EndpointId,
    /// Present in the schema for future use, not populated by any probe.
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub machine_id: MachineId,
    pub uid: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointPolicy {
    pub id: i64,
    pub endpoint_id: EndpointId,
    pub action: PolicyAction,
    pub src_endpoint_id: Option<EndpointId>,
    pub src_addr: String,
    pub priority: i64,
    pub source: String,
}

// ---------------------------------------------------------------------------
// Payload tree emitted after each scan.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadEndpoint {
    #[serde(flatten)]
    pub endpoint: ApplicationEndpoint,
    pub flows: Vec<Flow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadApplication {
    #[serde(flatten)]
    pub application: Application,
    pub endpoints: Vec<PayloadEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMachine {
    #[serde(flatten)]
    pub machine: Machine,
    pub cpu: Option<Cpu>,
    pub gpus: Vec<Gpu>,
    pub disks: Vec<Disk>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub subnetworks: Vec<Subnetwork>,
    pub packages: Vec<Package>,
    pub applications: Vec<PayloadApplication>,
    /// Endpoints bound on this machine's NICs without a known application.
    pub endpoints: Vec<PayloadEndpoint>,
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleReport {
    pub module: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Perfs {
    pub heap_alloc: u64,
    pub heap_sys: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadExtra {
    pub agent: Uuid,
    pub version: String,
    /// Scan duration in nanoseconds.
    pub duration: i64,
    /// RFC 3339.
    pub timestamp: String,
    pub errors: Vec<ModuleReport>,
    pub perfs: Perfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub machines: Vec<PayloadMachine>,
    pub extra: PayloadExtra,
}

/// Folds a MAC into the canonical upper-case colon form.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_uppercase().replace('-', ":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trip() {
        for p in [Protocol::Tcp, Protocol::Udp, Protocol::Tcp6, Protocol::Udp6] {
            assert_eq!(p.as_str().parse::<Protocol>().ok(), Some(p));
        }
        assert!("icmp".parse::<Protocol>().is_err());
    }

    #[test]
    fn mac_normalization() {
        assert_eq!(normalize_mac("52:54:00:ab:cd:ef"), "52:54:00:AB:CD:EF");
        assert_eq!(normalize_mac("52-54-00-AB-CD-EF"), "52:54:00:AB:CD:EF");
    }

    #[test]
    fn payload_json_round_trip() {
        let payload = Payload {
            machines: vec![],
            extra: PayloadExtra {
                agent: Uuid::nil(),
                version: "0.1.0".into(),
                duration: 1_500_000_000,
                timestamp: "2025-01-01T00:00:00Z".into(),
                errors: vec![ModuleReport {
                    module: "ping".into(),
                    message: "socket: operation not permitted".into(),
                }],
                perfs: Perfs::default(),
            },
        };
        let text = serde_json::to_string(&payload).unwrap();
        let back: Payload = serde_json::from_str(&text).unwrap();
        assert_eq!(back.extra.duration, payload.extra.duration);
        assert_eq!(back.extra.errors.len(), 1);
    }
}
