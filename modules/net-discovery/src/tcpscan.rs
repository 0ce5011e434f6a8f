use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use situation_core::{run_pool, Config, Module, ModuleError, ScanContext};
use situation_store::{strip_prefix_len, ApplicationEndpoint, NicId, Protocol};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

/// Commonly-used TCP ports, most interesting first.
const CURATED: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 123, 135, 139, 143, 389, 443, 445, 465, 500, 587, 636, 993,
    995, 1080, 1194, 1352, 1433, 1521, 1723, 2049, 2375, 2376, 3000, 3128, 3268, 3306, 3389,
    4444, 4500, 5000, 5060, 5432, 5601, 5671, 5672, 5900, 5985, 5986, 6379, 7001, 7002, 8000,
    8080, 8081, 8200, 8443, 8500, 8530, 8888, 9000, 9092, 9200, 9300, 9418, 9999, 10000,
    11211, 15672, 27017,
];

pub fn top_ports(n: usize) -> Vec<u16> {
    CURATED[..n.min(CURATED.len())].to_vec()
}

/// Connect-scans neighbour NICs on a curated port list. Open ports become
/// loose ApplicationEndpoints on the neighbour NIC; netstat and later probes
/// attach applications and protocols to them.
pub struct TcpScanModule;

#[async_trait]
impl Module for TcpScanModule {
    fn name(&self) -> &'static str {
        "tcp-scan"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["macvendor"]
    }

    fn bind(&self, config: &mut Config) {
        config.define("tcp-scan.timeout", 500, "connect timeout in milliseconds");
        config.define("tcp-scan.width", 64, "max concurrent connection attempts");
        config.define("tcp-scan.top", 64, "how many curated ports to probe per target");
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let per_port = Duration::from_millis(ctx.config.get("tcp-scan.timeout")?);
        let width: usize = ctx.config.get("tcp-scan.width")?;
        let ports = top_ports(ctx.config.get("tcp-scan.top")?);

        let host = ctx.store.get_or_create_host()?;
        let mut probes: Vec<(NicId, IpAddr, u16)> = Vec::new();
        for nic in ctx.store.neighbour_nics(host.id)? {
            for raw in &nic.ips {
                let Ok(addr) = strip_prefix_len(raw).parse::<IpAddr>() else { continue };
                if addr.is_loopback() {
                    continue;
                }
                probes.extend(ports.iter().map(|p| (nic.id, addr, *p)));
            }
        }
        if probes.is_empty() {
            return Ok(());
        }
        info!(probes = probes.len(), "scanning neighbour ports");

        let open = Arc::new(Mutex::new(Vec::<(NicId, IpAddr, u16)>::new()));
        let sink = open.clone();
        run_pool(width, probes, move |(nic, addr, port)| {
            let sink = sink.clone();
            async move {
                if matches!(timeout(per_port, TcpStream::connect((addr, port))).await, Ok(Ok(_))) {
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((nic, addr, port));
                }
                Ok(())
            }
        })
        .await;

        let found = std::mem::take(&mut *open.lock().unwrap_or_else(PoisonError::into_inner));
        info!(open = found.len(), "neighbour ports open");
        for (nic, addr, port) in found {
            let mut ep = ApplicationEndpoint {
                id: 0,
                application_id: None,
                network_interface_id: Some(nic),
                addr: addr.to_string(),
                port,
                protocol: if addr.is_ipv4() { Protocol::Tcp } else { Protocol::Tcp6 },
                application_protocols: None,
                saas: None,
                tls: None,
                fingerprints: None,
            };
            ctx.store.upsert_endpoint(&mut ep)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_ports_takes_a_prefix() {
        assert_eq!(top_ports(3), vec![21, 22, 23]);
        assert_eq!(top_ports(1000).len(), CURATED.len());
    }

    #[tokio::test]
    async fn open_and_closed_ports_are_told_apart() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        let t = Duration::from_millis(500);

        let open = timeout(t, TcpStream::connect((addr, port))).await;
        assert!(matches!(open, Ok(Ok(_))));
        drop(listener);
        let closed = timeout(t, TcpStream::connect((addr, port))).await;
        assert!(!matches!(closed, Ok(Ok(_))));
    }
}
