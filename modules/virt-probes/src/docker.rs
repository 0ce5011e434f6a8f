//! Container discovery through the docker engine API. Containers become
//! child machines of the machine running the daemon, with one NIC per
//! docker network and endpoint rows for published ports.

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use situation_core::{Module, ModuleError, ScanContext};
use situation_store::{
    Application, ApplicationEndpoint, EndpointPolicy, MachineId, NetworkInterface, PolicyAction,
    Protocol,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const DEFAULT_TCP_PORT: u16 = 2376;
const SWARM_LABEL: &str = "com.docker.swarm.service.id";

/// Reads containers from every reachable docker daemon: the local one
/// (`DOCKER_HOST`, then the platform default socket) and neighbours that
/// expose the engine API on tcp/2376.
pub struct DockerModule;

#[async_trait]
impl Module for DockerModule {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["saas"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let host = ctx.store.get_or_create_host()?;

        let mut daemons: Vec<(MachineId, DockerClient)> = Vec::new();
        if let Some(client) = local_client() {
            daemons.push((host.id, client));
        }
        for (machine_id, addr) in ctx.store.machines_with_open_tcp_port(DEFAULT_TCP_PORT)? {
            if machine_id == host.id {
                continue;
            }
            match DockerClient::tcp(&addr, DEFAULT_TCP_PORT) {
                Ok(client) => daemons.push((machine_id, client)),
                Err(e) => debug!(addr = %addr, error = %e, "no docker client for neighbour"),
            }
        }

        for (parent, client) in daemons {
            if let Err(e) = client.ping().await {
                debug!(daemon = %client, error = %e, "docker daemon not reachable");
                continue;
            }
            if let Err(e) = sync_daemon(ctx, parent, &client).await {
                warn!(daemon = %client, error = %e, "docker sync failed");
            }
        }
        Ok(())
    }
}

fn local_client() -> Option<DockerClient> {
    if let Ok(spec) = std::env::var("DOCKER_HOST") {
        match DockerClient::from_spec(&spec) {
            Ok(client) => return Some(client),
            Err(e) => debug!(spec = %spec, error = %e, "DOCKER_HOST not usable"),
        }
    }
    let default = if cfg!(windows) {
        "tcp://127.0.0.1:2376".to_string()
    } else {
        "unix:///var/run/docker.sock".to_string()
    };
    DockerClient::from_spec(&default).ok()
}

/// Walks networks, then the containers attached to each network.
async fn sync_daemon(ctx: &ScanContext, parent: MachineId, client: &DockerClient) -> Result<()> {
    let networks: Vec<Network> = client.get_json("/networks").await?;
    let mut containers = 0usize;
    for network in &networks {
        // gwbridge carries no container of its own, ingress belongs to swarm
        if network.name == "docker_gwbridge" || network.name == "ingress" {
            continue;
        }
        let subnet_id = match network.ipam.config.first() {
            Some(cfg) => match cfg.subnet.parse() {
                Ok(net) => Some(ctx.store.get_or_create_subnetwork(&net, &cfg.gateway, None)?),
                Err(_) => None,
            },
            None => None,
        };
        for container_id in network.containers.keys() {
            // swarm load-balancer pseudo containers
            if container_id.starts_with("lb-") {
                continue;
            }
            match sync_container(ctx, parent, client, network, container_id, subnet_id).await {
                Ok(true) => containers += 1,
                Ok(false) => {}
                Err(e) => debug!(container = %container_id, error = %e, "container skipped"),
            }
        }
    }
    info!(daemon = %client, networks = networks.len(), containers, "docker scan done");
    Ok(())
}

async fn sync_container(
    ctx: &ScanContext,
    parent: MachineId,
    client: &DockerClient,
    network: &Network,
    container_id: &str,
    subnet_id: Option<i64>,
) -> Result<bool> {
    let inspect: ContainerInspect =
        client.get_json(&format!("/containers/{container_id}/json")).await?;
    if inspect.config.labels.get(SWARM_LABEL).is_some_and(|id| !id.is_empty()) {
        debug!(container = %container_id, "managed by swarm, ignoring");
        return Ok(false);
    }

    let (image, version) = split_image(&inspect.config.image);
    let mut machine = match ctx.store.machine_by_host_id(container_id)? {
        Some(m) => m,
        None => {
            let id = ctx.store.new_empty_machine()?;
            ctx.store.get_machine(id)?
        }
    };
    machine.hostname = inspect.name.trim_start_matches('/').to_string();
    machine.host_id = container_id.to_string();
    machine.platform = "docker".to_string();
    machine.chassis = "container".to_string();
    machine.distribution = image.to_string();
    machine.distribution_version = version.to_string();
    machine.parent_machine_id = Some(parent);
    machine.uptime_ns = uptime_since(&inspect.created);
    ctx.store.update_machine(&machine)?;
    info!(
        container = %machine.hostname,
        image,
        version,
        parent,
        "created or updated container machine"
    );

    let Some(settings) = inspect.network_settings.networks.get(&network.name) else {
        warn!(container = %machine.hostname, network = %network.name, "no network settings");
        return Ok(true);
    };

    let mut ips = Vec::new();
    if !settings.ip_address.is_empty() {
        ips.push(format!("{}/{}", settings.ip_address, settings.ip_prefix_len));
    }
    if !settings.global_ipv6_address.is_empty() {
        ips.push(format!("{}/{}", settings.global_ipv6_address, settings.global_ipv6_prefix_len));
    }
    let mut nic = NetworkInterface {
        machine_id: Some(machine.id),
        name: network.name.clone(),
        mac: settings.mac_address.to_uppercase(),
        ips,
        gateway: settings.gateway.clone(),
        ..NetworkInterface::default()
    };
    let nic_id = ctx.store.upsert_nic(&mut nic)?;
    if let Some(subnet_id) = subnet_id {
        ctx.store.link_nic_subnet(nic_id, subnet_id)?;
    }

    // the container's sole application, named after its image
    let mut app = Application {
        machine_id: machine.id,
        name: image.to_string(),
        version: version.to_string(),
        protocol: "tcp".to_string(),
        ..Application::default()
    };
    let app_id = ctx.store.upsert_application(&mut app)?;

    for (key, bindings) in &inspect.network_settings.ports {
        let Some((private_port, protocol)) = parse_port_key(key) else { continue };
        let mut container_ep = ApplicationEndpoint {
            id: 0,
            application_id: Some(app_id),
            network_interface_id: Some(nic_id),
            addr: settings.ip_address.clone(),
            port: private_port,
            protocol,
            application_protocols: None,
            saas: None,
            tls: None,
            fingerprints: None,
        };
        let container_ep_id = ctx.store.upsert_endpoint(&mut container_ep)?;

        for binding in bindings.iter().flatten() {
            let Ok(public_port) = binding.host_port.parse::<u16>() else { continue };
            // wildcard binds are preserved as-is
            let host_addr = if binding.host_ip.is_empty() {
                "0.0.0.0".to_string()
            } else {
                binding.host_ip.clone()
            };
            let mut host_ep = ApplicationEndpoint {
                id: 0,
                application_id: None,
                network_interface_id: None,
                addr: host_addr.clone(),
                port: public_port,
                protocol,
                application_protocols: None,
                saas: None,
                tls: None,
                fingerprints: None,
            };
            let host_ep_id = ctx.store.upsert_endpoint(&mut host_ep)?;
            ctx.store.upsert_policy(&EndpointPolicy {
                id: 0,
                endpoint_id: container_ep_id,
                action: PolicyAction::Forward,
                src_endpoint_id: Some(host_ep_id),
                src_addr: host_addr,
                priority: 0,
                source: "docker".to_string(),
            })?;
        }
    }
    Ok(true)
}

/// `name:tag` with an optional trailing `@sha256:…` on the tag.
fn split_image(image: &str) -> (&str, &str) {
    match image.split_once(':') {
        None => (image, "latest"),
        Some((name, tag)) => (name, tag.split('@').next().unwrap_or(tag)),
    }
}

fn uptime_since(created: &str) -> Option<i64> {
    let created = OffsetDateTime::parse(created, &Rfc3339).ok()?;
    let elapsed = OffsetDateTime::now_utc() - created;
    Some(elapsed.whole_nanoseconds().clamp(0, i64::MAX as i128) as i64)
}

/// `"80/tcp"` from the NetworkSettings port map.
fn parse_port_key(key: &str) -> Option<(u16, Protocol)> {
    let (port, proto) = key.split_once('/')?;
    Some((port.parse().ok()?, proto.parse().ok()?))
}

// Engine API ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Network {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "IPAM", default)]
    ipam: Ipam,
    #[serde(rename = "Containers", default)]
    containers: HashMap<String, NetworkEndpoint>,
}

#[derive(Debug, Default, Deserialize)]
struct Ipam {
    #[serde(rename = "Config", default)]
    config: Vec<IpamConfig>,
}

#[derive(Debug, Deserialize)]
struct IpamConfig {
    #[serde(rename = "Subnet", default)]
    subnet: String,
    #[serde(rename = "Gateway", default)]
    gateway: String,
}

#[derive(Debug, Deserialize)]
struct NetworkEndpoint {}

#[derive(Debug, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Created")]
    created: String,
    #[serde(rename = "Config")]
    config: ContainerConfig,
    #[serde(rename = "NetworkSettings")]
    network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, EndpointSettings>,
    #[serde(rename = "Ports", default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Deserialize)]
struct EndpointSettings {
    #[serde(rename = "MacAddress", default)]
    mac_address: String,
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "IPPrefixLen", default)]
    ip_prefix_len: u8,
    #[serde(rename = "GlobalIPv6Address", default)]
    global_ipv6_address: String,
    #[serde(rename = "GlobalIPv6PrefixLen", default)]
    global_ipv6_prefix_len: u8,
    #[serde(rename = "Gateway", default)]
    gateway: String,
}

#[derive(Debug, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostIp", default)]
    host_ip: String,
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

// Transport -----------------------------------------------------------------

/// The engine API speaks plain HTTP, either over a unix socket or over TCP.
enum DockerClient {
    #[cfg(unix)]
    Unix(std::path::PathBuf),
    Tcp {
        base: String,
        http: reqwest::Client,
    },
}

impl fmt::Display for DockerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            DockerClient::Unix(path) => write!(f, "unix://{}", path.display()),
            DockerClient::Tcp { base, .. } => f.write_str(base),
        }
    }
}

impl DockerClient {
    fn from_spec(spec: &str) -> Result<DockerClient> {
        if let Some(path) = spec.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                return Ok(DockerClient::Unix(path.into()));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                bail!("unix sockets are not supported on this platform");
            }
        }
        if let Some(addr) = spec.strip_prefix("tcp://") {
            let (host, port) = match addr.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse()?),
                None => (addr.to_string(), DEFAULT_TCP_PORT),
            };
            return DockerClient::tcp(&host, port);
        }
        bail!("unsupported docker host spec: {spec}");
    }

    fn tcp(host: &str, port: u16) -> Result<DockerClient> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()?;
        Ok(DockerClient::Tcp { base: format!("http://{host}:{port}"), http })
    }

    async fn ping(&self) -> Result<()> {
        let body = self.get("/_ping").await?;
        if body.trim() != "OK" {
            bail!("unexpected ping reply: {body:.20}");
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.get(path).await?;
        serde_json::from_str(&body).with_context(|| format!("decoding GET {path}"))
    }

    async fn get(&self, path: &str) -> Result<String> {
        match self {
            #[cfg(unix)]
            DockerClient::Unix(socket) => {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut stream = tokio::net::UnixStream::connect(socket)
                    .await
                    .with_context(|| format!("connecting {}", socket.display()))?;
                // HTTP/1.0 keeps the reply unchunked and closed by the server
                let request =
                    format!("GET {path} HTTP/1.0\r\nHost: docker\r\nAccept: application/json\r\n\r\n");
                stream.write_all(request.as_bytes()).await?;
                let mut raw = Vec::new();
                stream.read_to_end(&mut raw).await?;
                parse_http_response(&raw)
            }
            DockerClient::Tcp { base, http } => {
                let response = http.get(format!("{base}{path}")).send().await?;
                let status = response.status();
                let body = response.text().await?;
                if !status.is_success() {
                    bail!("GET {path}: status {status}");
                }
                Ok(body)
            }
        }
    }
}

/// Body of a plain HTTP/1.0 response, status checked.
fn parse_http_response(raw: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(raw);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        bail!("truncated HTTP response");
    };
    let status_line = head.lines().next().unwrap_or_default();
    let code = status_line.split_whitespace().nth(1).unwrap_or_default();
    if code != "200" {
        bail!("HTTP status {code}");
    }
    Ok(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names_split_into_name_and_tag() {
        assert_eq!(split_image("nginx"), ("nginx", "latest"));
        assert_eq!(split_image("nginx:1.25"), ("nginx", "1.25"));
        assert_eq!(
            split_image("redis:7@sha256:0123abcd"),
            ("redis", "7")
        );
    }

    #[test]
    fn port_keys_split_into_port_and_protocol() {
        assert_eq!(parse_port_key("80/tcp"), Some((80, Protocol::Tcp)));
        assert_eq!(parse_port_key("53/udp"), Some((53, Protocol::Udp)));
        assert_eq!(parse_port_key("80"), None);
        assert_eq!(parse_port_key("x/tcp"), None);
    }

    #[test]
    fn http_responses_reduce_to_their_body() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nOK";
        assert_eq!(parse_http_response(raw).unwrap(), "OK");

        let raw = b"HTTP/1.0 404 Not Found\r\n\r\n{}";
        assert!(parse_http_response(raw).is_err());
        assert!(parse_http_response(b"garbage").is_err());
    }

    #[test]
    fn inspect_payloads_decode() {
        let payload = r#"{
            "Id": "abc123",
            "Name": "/web",
            "Created": "2026-08-25T10:00:00.000000000Z",
            "Config": {"Image": "nginx:1.25", "Labels": {}},
            "NetworkSettings": {
                "Networks": {"bridge": {
                    "MacAddress": "02:42:ac:11:00:02",
                    "IPAddress": "172.17.0.2",
                    "IPPrefixLen": 16,
                    "Gateway": "172.17.0.1"
                }},
                "Ports": {"80/tcp": [{"HostIp": "0.0.0.0", "HostPort": "8080"}], "443/tcp": null}
            }
        }"#;
        let inspect: ContainerInspect = serde_json::from_str(payload).unwrap();
        assert_eq!(inspect.name, "/web");
        assert_eq!(inspect.config.image, "nginx:1.25");
        let settings = &inspect.network_settings.networks["bridge"];
        assert_eq!(settings.ip_address, "172.17.0.2");
        assert_eq!(settings.ip_prefix_len, 16);
        assert!(inspect.network_settings.ports["443/tcp"].is_none());
        assert!(uptime_since(&inspect.created).is_some());
    }

    #[test]
    fn host_specs_resolve_to_clients() {
        assert!(DockerClient::from_spec("tcp://10.0.0.4:2376").is_ok());
        assert!(DockerClient::from_spec("ssh://root@host").is_err());
        #[cfg(unix)]
        assert!(matches!(
            DockerClient::from_spec("unix:///var/run/docker.sock"),
            Ok(DockerClient::Unix(_))
        ));
    }
}
