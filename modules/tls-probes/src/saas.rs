//! SaaS attribution. Endpoints are matched against a registry of known
//! services, either by IP range (published provider ranges) or by TLS DNS
//! name suffix. The first matching service wins.

use std::net::IpAddr;
use std::sync::OnceLock;

use async_trait::async_trait;
use ipnet::IpNet;
use situation_core::{Config, Module, ModuleError, ScanContext};
use tracing::{debug, info};

/// Attributes endpoints to the SaaS they belong to. Only a bounded batch of
/// unattributed endpoints is processed per scan.
pub struct SaasModule;

#[async_trait]
impl Module for SaasModule {
    fn name(&self) -> &'static str {
        "saas"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["ja4"]
    }

    fn bind(&self, config: &mut Config) {
        config.define("saas.max-endpoints", 50, "max endpoints to process per scan");
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let limit: usize = ctx.config.get("saas.max-endpoints")?;
        let endpoints = ctx.store.endpoints_without_saas(limit)?;
        if endpoints.is_empty() {
            return Ok(());
        }

        let mut attributed = 0;
        for ep in &endpoints {
            let Ok(addr) = ep.addr.parse::<IpAddr>() else { continue };
            let dns_names = ep.tls.as_ref().map(|t| t.dns_names.as_slice()).unwrap_or(&[]);
            match identify(addr, dns_names) {
                Some(name) => {
                    info!(ip = %ep.addr, port = ep.port, saas = name, "SaaS application detected");
                    ctx.store.set_endpoint_saas(ep.id, name)?;
                    attributed += 1;
                }
                None => debug!(ip = %ep.addr, port = ep.port, "no SaaS match"),
            }
        }
        info!(endpoints = endpoints.len(), attributed, "SaaS attribution done");
        Ok(())
    }
}

pub(crate) fn identify(addr: IpAddr, dns_names: &[String]) -> Option<&'static str> {
    for service in services() {
        if service.networks.iter().any(|net| net.contains(&addr)) {
            return Some(service.name);
        }
        for dns in dns_names {
            if service.suffixes.iter().any(|s| dns.ends_with(s)) {
                return Some(service.name);
            }
        }
    }
    None
}

struct Service {
    name: &'static str,
    networks: Vec<IpNet>,
    suffixes: &'static [&'static str],
}

fn services() -> &'static [Service] {
    static SERVICES: OnceLock<Vec<Service>> = OnceLock::new();
    SERVICES.get_or_init(|| {
        REGISTRY
            .iter()
            .map(|(name, cidrs, suffixes)| Service {
                name,
                networks: cidrs.iter().filter_map(|c| c.parse().ok()).collect(),
                suffixes,
            })
            .collect()
    })
}

type Entry = (&'static str, &'static [&'static str], &'static [&'static str]);

/// Known services: (name, IP ranges, DNS suffixes). A suffix starting with
/// a dot matches subdomains, a bare name matches exactly (both through
/// `ends_with`).
static REGISTRY: &[Entry] = &[
    // https://ipinfo.io/AS399358
    (
        "Anthropic",
        &["160.79.104.0/23", "209.249.57.0/24", "2607:6bc0::/48", "2607:6bc0:11::/48"],
        &[],
    ),
    // https://docs.datadoghq.com/api/latest/ip-ranges/
    (
        "Datadog",
        &[
            "100.28.212.0/22",
            "107.21.25.247/32",
            "108.137.133.223/32",
            "108.137.188.57/32",
            "13.114.211.96/32",
            "13.115.46.213/32",
            "13.126.169.175/32",
            "13.208.126.217/32",
            "13.208.133.55/32",
            "13.208.142.17/32",
            "13.208.255.200/32",
            "13.209.118.42/32",
            "13.209.230.111/32",
            "13.234.54.8/32",
            "13.236.246.161/32",
            "13.238.14.57/32",
            "13.244.188.203/32",
            "13.244.85.86/32",
            "13.245.194.43/32",
            "13.245.200.254/32",
            "13.246.172.210/32",
            "13.247.164.9/32",
            "13.48.150.244/32",
            "13.48.239.118/32",
            "13.48.254.37/32",
            "13.54.169.48/32",
            "15.152.238.192/32",
            "15.161.86.71/32",
            "15.165.240.116/32",
            "15.168.188.85/32",
            "15.184.139.182/32",
            "15.185.189.82/32",
            "15.188.202.64/32",
            "15.188.240.172/32",
            "15.188.243.248/32",
            "157.241.36.106/32",
            "157.241.93.102/32",
            "16.162.136.62/32",
            "16.163.153.45/32",
            "16.24.38.13/32",
            "16.24.60.114/32",
            "18.102.80.189/32",
            "18.130.113.168/32",
            "18.139.52.173/32",
            "18.163.21.55/32",
            "18.163.59.106/32",
            "18.166.19.255/32",
            "18.195.155.52/32",
            "18.200.120.237/32",
            "18.229.28.50/32",
            "18.229.36.120/32",
            "20.62.248.141/32",
            "20.83.144.189/32",
            "23.20.198.65/32",
            "23.23.216.60/32",
            "3.120.223.25/32",
            "3.121.24.234/32",
            "3.1.219.207/32",
            "3.1.36.99/32",
            "3.18.172.189/32",
            "3.18.188.104/32",
            "3.18.197.0/32",
            "3.210.147.169/32",
            "3.220.254.141/32",
            "3.233.144.0/20",
            "3.35.66.96/32",
            "3.36.177.119/32",
            "34.145.82.128/29",
            "34.146.154.144/29",
            "34.159.50.128/29",
            "34.174.98.16/29",
            "34.203.1.9/32",
            "34.204.83.4/32",
            "34.208.32.189/32",
            "34.233.140.66/32",
            "34.48.76.208/29",
            "34.94.234.88/29",
            "35.152.76.8/32",
            "35.154.93.182/32",
            "35.172.176.208/32",
            "35.176.195.46/32",
            "35.177.43.250/32",
            "3.92.150.182/32",
            "3.96.7.126/32",
            "40.76.107.170/32",
            "43.198.123.228/32",
            "43.203.72.233/32",
            "43.218.5.202/32",
            "44.192.28.0/25",
            "52.1.33.14/32",
            "52.1.61.69/32",
            "52.192.175.207/32",
            "52.35.61.232/32",
            "52.55.56.26/32",
            "52.60.189.53/32",
            "52.67.95.251/32",
            "52.89.221.151/32",
            "52.9.13.199/32",
            "52.9.139.134/32",
            "54.157.36.5/32",
            "54.177.155.33/32",
            "54.92.248.81/32",
            "63.34.100.178/32",
            "63.35.33.198/32",
            "99.79.87.237/32",
            "2600:1f18:24e6:b900::/56",
        ],
        &[],
    ),
    // dig dl.flathub.org +short
    (
        "Flathub",
        &["151.101.129.91/32", "151.101.65.91/32", "151.101.1.91/32", "151.101.193.91/32"],
        &[],
    ),
    ("GitHub", &[], &[".github.com", ".github.io", ".githubusercontent.com"]),
    (
        "Microsoft Outlook",
        &[
            "13.107.6.152/31",
            "13.107.18.10/31",
            "13.107.128.0/22",
            "23.103.160.0/20",
            "40.96.0.0/13",
            "40.104.0.0/15",
            "52.96.0.0/14",
            "131.253.33.215/32",
            "132.245.0.0/16",
            "150.171.32.0/22",
            "204.79.197.215/32",
            "2603:1006::/40",
            "2603:1016::/36",
            "2603:1026::/36",
            "2603:1036::/36",
            "2603:1046::/36",
            "2603:1056::/36",
            "2620:1ec:4::152/128",
            "2620:1ec:4::153/128",
            "2620:1ec:c::10/128",
            "2620:1ec:c::11/128",
            "2620:1ec:d::10/128",
            "2620:1ec:d::11/128",
            "2620:1ec:8f0::/46",
            "2620:1ec:900::/46",
            "2620:1ec:a92::152/128",
            "2620:1ec:a92::153/128",
        ],
        &[
            ".outlook.com",
            "outlook.cloud.microsoft",
            "outlook.office.com",
            "outlook.office365.com",
            ".mx.microsoft",
        ],
    ),
    (
        "Sentry",
        &[
            "35.186.247.156/32",
            "34.36.122.224/32",
            "34.36.87.148/32",
            "34.120.195.249/32",
            "34.160.81.0/32",
            "34.102.210.18/32",
            "2600:1901:0:5e8a::/64",
            "2600:1901:0:7edb::/64",
            "34.120.62.213/32",
            "34.96.102.34/32",
            "35.184.238.160/32",
            "104.155.159.182/32",
            "104.155.149.19/32",
            "130.211.230.102/32",
            "34.141.31.19/32",
            "34.141.4.162/32",
            "35.234.78.236/32",
            "167.89.86.73/32",
            "167.89.84.75/32",
            "167.89.84.14/32",
            "34.123.33.225/32",
            "34.41.121.171/32",
            "34.169.179.115/32",
            "35.237.134.233/32",
            "34.85.249.57/32",
            "34.159.197.47/32",
            "35.242.231.10/32",
            "34.107.93.3/32",
            "35.204.169.245/32",
        ],
        &[".sentry.io"],
    ),
    (
        "SharePoint",
        &[
            "13.107.136.0/22",
            "40.108.128.0/17",
            "52.104.0.0/14",
            "104.146.128.0/17",
            "150.171.40.0/22",
            "2603:1061:1300::/40",
            "2603:1063:6000::/35",
            "2620:1ec:8f8::/46",
            "2620:1ec:908::/46",
            "2a01:111:f402::/48",
        ],
        &[".sharepoint.com", ".sharepointonline.com"],
    ),
    (
        "Microsoft Teams",
        &[
            "52.112.0.0/14",
            "52.122.0.0/15",
            "2603:1027::/48",
            "2603:1037::/48",
            "2603:1047::/48",
            "2603:1057::/48",
            "2603:1063::/38",
            "2620:1ec:6::/48",
            "2620:1ec:40::/42",
        ],
        &[
            ".lync.com",
            ".teams.cloud.microsoft",
            ".teams.microsoft.com",
            "teams.cloud.microsoft",
            "teams.microsoft.com",
            ".skype.com",
        ],
    ),
    (
        "Windows Update",
        &[],
        &[
            ".windowsupdate.microsoft.com",
            ".update.microsoft.com",
            ".windowsupdate.com",
            "download.windowsupdate.com",
            "download.microsoft.com",
            ".download.windowsupdate.com",
            "wustat.windows.com",
            "ntservicepack.microsoft.com",
            ".delivery.mp.microsoft.com",
            "dl.delivery.mp.microsoft.com",
        ],
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_registered_range_parses() {
        for (name, cidrs, _) in REGISTRY {
            for cidr in *cidrs {
                assert!(cidr.parse::<IpNet>().is_ok(), "{name}: bad CIDR {cidr}");
            }
        }
        let parsed: usize = services().iter().map(|s| s.networks.len()).sum();
        let declared: usize = REGISTRY.iter().map(|(_, c, _)| c.len()).sum();
        assert_eq!(parsed, declared);
    }

    #[test]
    fn ip_ranges_identify_a_service_without_dns_names() {
        let addr: IpAddr = "160.79.105.10".parse().unwrap();
        assert_eq!(identify(addr, &[]), Some("Anthropic"));

        let addr: IpAddr = "2607:6bc0::1".parse().unwrap();
        assert_eq!(identify(addr, &[]), Some("Anthropic"));

        let addr: IpAddr = "151.101.1.91".parse().unwrap();
        assert_eq!(identify(addr, &[]), Some("Flathub"));
    }

    #[test]
    fn dns_suffixes_identify_a_service() {
        let addr: IpAddr = "203.0.113.9".parse().unwrap();
        let names = vec!["raw.githubusercontent.com".to_string()];
        assert_eq!(identify(addr, &names), Some("GitHub"));

        let names = vec!["o450123.ingest.sentry.io".to_string()];
        assert_eq!(identify(addr, &names), Some("Sentry"));

        // bare suffixes match the exact name too
        let names = vec!["teams.microsoft.com".to_string()];
        assert_eq!(identify(addr, &names), Some("Microsoft Teams"));
    }

    #[test]
    fn unknown_endpoints_stay_unattributed() {
        let addr: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(identify(addr, &[]), None);
        let names = vec!["example.com".to_string()];
        assert_eq!(identify(addr, &names), None);
    }
}
