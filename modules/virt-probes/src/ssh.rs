//! SSH banner collection on tcp/22 endpoints. The server identification
//! line carries the software version and, for distribution builds, enough
//! evidence to name the operating system release.

use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use regex::Regex;
use situation_core::{run_pool, Config, Module, ModuleError, ScanContext};
use situation_store::{Application, ApplicationEndpoint, Store};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Reads the identification string of reachable SSH servers and turns it
/// into application and machine facts: product, version, CPE and the
/// distribution the build ships with.
pub struct SshModule;

#[async_trait]
impl Module for SshModule {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["vmware"]
    }

    fn bind(&self, config: &mut Config) {
        config.define("ssh.timeout", 2000, "banner read timeout in milliseconds");
        config.define("ssh.width", 16, "max concurrent banner reads");
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let wait = Duration::from_millis(ctx.config.get("ssh.timeout")?);
        let width: usize = ctx.config.get("ssh.width")?;

        let mut probes = Vec::new();
        for ep in ctx.store.endpoints_with_ports(&[22])? {
            let Ok(addr) = ep.addr.parse::<IpAddr>() else { continue };
            if addr.is_unspecified() {
                continue;
            }
            probes.push((ep, addr));
        }
        if probes.is_empty() {
            return Ok(());
        }

        let store = ctx.store.clone();
        run_pool(width, probes, move |(ep, addr)| {
            let store = store.clone();
            async move {
                let port = ep.port;
                match read_banner(addr, port, wait).await {
                    Ok(banner) => {
                        info!(ip = %addr, port, banner = %banner, "SSH service found");
                        record(&store, ep, &banner)?;
                    }
                    Err(e) => debug!(ip = %addr, port, error = %e, "no SSH banner"),
                }
                Ok(())
            }
        })
        .await;
        Ok(())
    }
}

/// The server talks first: its identification line ends the handshake
/// preamble, so a single read loop up to the newline is enough.
async fn read_banner(addr: IpAddr, port: u16, wait: Duration) -> Result<String> {
    let mut socket = timeout(wait, TcpStream::connect((addr, port)))
        .await
        .context("connect timeout")??;
    let raw = timeout(wait, async {
        let mut buf = Vec::with_capacity(256);
        let mut chunk = [0u8; 64];
        loop {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.contains(&b'\n') || buf.len() >= 255 {
                break;
            }
        }
        Ok::<_, std::io::Error>(buf)
    })
    .await
    .context("banner read timeout")??;

    let first = raw.split(|b| *b == b'\n').next().unwrap_or(&[]);
    let line = String::from_utf8_lossy(first).trim_end_matches('\r').to_string();
    if !line.starts_with("SSH-") {
        bail!("not an SSH identification line");
    }
    Ok(line)
}

/// Marks the endpoint as speaking ssh and folds banner facts into the
/// owning application and machine, without overwriting anything a host
/// probe already knows.
fn record(store: &Store, mut ep: ApplicationEndpoint, banner: &str) -> Result<()> {
    let facts = analyze_banner(banner);

    let mut protocols = ep.application_protocols.take().unwrap_or_default();
    if !protocols.iter().any(|p| p == "ssh") {
        protocols.push("ssh".to_string());
    }
    ep.application_protocols = Some(protocols);

    let machine_id = match ep.network_interface_id {
        Some(nic_id) => store.get_nic(nic_id)?.machine_id,
        None => None,
    };

    if let Some(machine_id) = machine_id {
        let mut machine = store.get_machine(machine_id)?;
        if machine.platform.is_empty() {
            machine.platform = facts.platform.clone();
        }
        if machine.distribution.is_empty() {
            machine.distribution = facts.distribution.clone();
        }
        if machine.distribution_version.is_empty() {
            machine.distribution_version = facts.distribution_version.clone();
        }
        store.update_machine(&machine)?;

        let mut app = match ep.application_id {
            Some(id) => store
                .applications_by_machine(machine_id)?
                .into_iter()
                .find(|a| a.id == id)
                .unwrap_or_default(),
            None => Application::default(),
        };
        app.machine_id = machine_id;
        app.protocol = "ssh".to_string();
        if app.name.is_empty() {
            app.name = facts.product.clone();
        }
        if app.version.is_empty() {
            app.version = facts.version.clone();
        }
        if app.cpe.is_empty() {
            app.cpe = facts.cpe.clone();
        }
        app.config.insert("banner".to_string(), banner.to_string());
        if !app.name.is_empty() {
            let app_id = store.upsert_application(&mut app)?;
            ep.application_id = Some(app_id);
        }
    }

    store.upsert_endpoint(&mut ep)?;
    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct BannerFacts {
    product: String,
    version: String,
    cpe: String,
    platform: String,
    distribution: String,
    distribution_version: String,
}

fn analyze_banner(banner: &str) -> BannerFacts {
    if banner.to_lowercase().contains("openssh") {
        parse_openssh_banner(banner)
    } else {
        BannerFacts::default()
    }
}

// OpenSSH builds shipped by Ubuntu releases
static UBUNTU_BUILDS: &[(&str, &str)] = &[
    ("9.7p1-7", "24.10"),
    ("9.6p1-3", "24.04"),
    ("9.3p1-1", "23.10"),
    ("9.0p1-1", "22.10"),
    ("8.9p1-3", "22.04"),
    ("8.4p1-6", "21.10"),
    ("8.4p1-5", "21.04"),
    ("8.3p1-1", "20.10"),
    ("8.2p1-4", "20.04"),
    ("8.0p1-6", "19.10"),
    ("7.9p1-10", "19.04"),
    ("7.7p1-4", "18.10"),
    ("7.6p1-4", "18.04"),
    ("7.5p1-10", "17.10"),
    ("7.4p1-10", "17.04"),
    ("7.3p1-1", "16.10"),
    ("7.2p2-4", "16.04"),
    ("6.9p1-2", "15.10"),
    ("6.7p1-5", "15.04"),
    ("6.6.1p1-8", "14.10"),
    ("6.6.1p1-2", "14.04"),
    ("6.2p2-6", "13.10"),
    ("6.1p1-4", "13.04"),
    ("6.0p1-3", "12.10"),
    ("5.9p1-5", "12.04"),
    ("5.8p1-7", "11.10"),
    ("5.8p1-1", "11.04"),
    ("5.5p1-4", "10.10"),
    ("5.3p1-3", "10.04"),
    ("5.1p1-6", "9.10"),
    ("5.1p1-5", "9.04"),
    ("5.1p1-3", "8.10"),
    ("4.7p1-8", "8.04"),
    ("4.6p1-5", "7.10"),
    ("4.3p2-8", "7.04"),
    ("4.3p2-5", "6.10"),
    ("4.2p1-7", "6.06"),
    ("4.1p1-7", "5.10"),
    ("3.9p1-1", "5.04"),
    ("3.8.1p1-11", "4.10"),
];

// OpenSSH builds shipped by Debian releases, also used for Raspbian
static DEBIAN_BUILDS: &[(&str, &str)] = &[
    ("9.2p1-2", "12"),
    ("8.4p1-5", "11"),
    ("7.9p1-10", "10"),
    ("7.4p1-10", "9"),
    ("7.4p-9", "9"),
    ("6.7p1-5", "8"),
    ("6.0p1-4", "7"),
    ("6.0p1-2", "7"),
    ("5.8p1-4", "6"),
    ("5.5p1-6", "6"),
    ("5.1p1-5", "5"),
    ("4.3p2-9", "4"),
    ("3.8.1p1-8", "3.1"),
    ("3.4p1-1", "3.0"),
];

// FreeBSD stamps its banner with a build date
static FREEBSD_BUILDS: &[(&str, &str)] = &[
    ("20240806", "14.2"),
    ("20240318", "14.1"),
    ("20230316", "13.2"),
    ("20200214", "12.2"),
    ("20130515", "9.2"),
];

static WINDOWS_BUILDS: &[(&str, &str)] = &[
    ("7.7", "Microsoft Windows Server 2016"),
    ("8.1", "Microsoft Windows Server 2019"),
    ("9.8", "Microsoft Windows Server 2022"),
];

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn parse_openssh_banner(banner: &str) -> BannerFacts {
    static WINDOWS_RE: OnceLock<Regex> = OnceLock::new();
    static LONG_RE: OnceLock<Regex> = OnceLock::new();
    static SHORT_RE: OnceLock<Regex> = OnceLock::new();
    static BUILD_RE: OnceLock<Regex> = OnceLock::new();
    static DATE_RE: OnceLock<Regex> = OnceLock::new();

    let mut out = BannerFacts {
        product: "OpenSSH".to_string(),
        ..BannerFacts::default()
    };

    let windows_re =
        WINDOWS_RE.get_or_init(|| Regex::new(r"OpenSSH_for_Windows_(\d+\.\d+)").unwrap());
    if let Some(caps) = windows_re.captures(banner) {
        out.platform = "windows".to_string();
        out.version = caps[1].to_string();
        if let Some(distribution) = lookup(WINDOWS_BUILDS, &out.version) {
            out.distribution = distribution.to_string();
        }
        return out;
    }
    out.platform = "linux".to_string();

    // three-part versions first so 6.6.1p1 is not cut down to 6.6
    let long_re =
        LONG_RE.get_or_init(|| Regex::new(r"OpenSSH[-_](\d+\.\d+\.\d+(?:p\d+)?)").unwrap());
    let short_re = SHORT_RE.get_or_init(|| Regex::new(r"OpenSSH[-_](\d+\.\d+(?:p\d+)?)").unwrap());
    match long_re.captures(banner).or_else(|| short_re.captures(banner)) {
        Some(caps) => out.version = caps[1].to_string(),
        None => return out,
    }

    out.cpe = match out.version.split_once('p') {
        Some((version, patch)) => {
            format!("cpe:2.3:a:openbsd:openssh:{version}:p{patch}:*:*:*:*:*:*")
        }
        None => format!("cpe:2.3:a:openbsd:openssh:{}:-:*:*:*:*:*:*", out.version),
    };

    // package build number, e.g. the `-5` of `Debian-5+deb11u3`
    let mut full_version = String::new();
    if let Some(offset) = banner.find(&out.version) {
        let rest = &banner[offset + out.version.len()..];
        let build_re = BUILD_RE.get_or_init(|| Regex::new(r"-(\d+)").unwrap());
        if let Some(caps) = build_re.captures(rest) {
            full_version = format!("{}-{}", out.version, &caps[1]);
        }
    }

    if banner.contains("Ubuntu") {
        out.distribution = "ubuntu".to_string();
        if let Some(v) = lookup(UBUNTU_BUILDS, &full_version) {
            out.distribution_version = v.to_string();
        }
    } else if banner.contains("Debian") {
        out.distribution = "debian".to_string();
        if let Some(v) = lookup(DEBIAN_BUILDS, &full_version) {
            out.distribution_version = v.to_string();
        }
    } else if banner.contains("FreeBSD") {
        out.distribution = "freebsd".to_string();
        let date_re = DATE_RE.get_or_init(|| Regex::new(r"(\d{8})").unwrap());
        if let Some(caps) = date_re.captures(banner) {
            if let Some(v) = lookup(FREEBSD_BUILDS, &caps[1]) {
                out.distribution_version = v.to_string();
            }
        }
    } else if banner.contains("Raspbian") {
        out.distribution = "raspbian".to_string();
        if let Some(v) = lookup(DEBIAN_BUILDS, &full_version) {
            out.distribution_version = v.to_string();
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANNERS: &[&str] = &[
        "SSH-2.0-OpenSSH_7.9p1 Raspbian-10+deb10u4",
        "SSH-2.0-OpenSSH_8.4p1 Debian-5+deb11u3",
        "SSH-2.0-OpenSSH_for_Windows_7.7",
        "SSH-2.0-OpenSSH_for_Windows_8.1",
        "SSH-2.0-OpenSSH_for_Windows_9.8 Win32-OpenSSH-GitHub",
        "SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13.8",
        "SSH-2.0-OpenSSH_9.3",
        "SSH-2.0-OpenSSH_9.6",
        "SSH-2.0-OpenSSH_9.9",
        "SSH-2.0-OpenSSH_8.7",
        "SSH-2.0-OpenSSH_8.0",
    ];

    #[test]
    fn every_openssh_banner_yields_product_and_version() {
        for banner in BANNERS {
            let facts = parse_openssh_banner(banner);
            assert_eq!(facts.product, "OpenSSH", "banner: {banner}");
            assert!(!facts.version.is_empty(), "banner: {banner}");
        }
    }

    #[test]
    fn distribution_builds_are_recognized() {
        let ubuntu = parse_openssh_banner("SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13.8");
        assert_eq!(ubuntu.version, "9.6p1");
        assert_eq!(ubuntu.distribution, "ubuntu");
        assert_eq!(ubuntu.distribution_version, "24.04");

        let debian = parse_openssh_banner("SSH-2.0-OpenSSH_8.4p1 Debian-5+deb11u3");
        assert_eq!(debian.distribution, "debian");
        assert_eq!(debian.distribution_version, "11");

        let raspbian = parse_openssh_banner("SSH-2.0-OpenSSH_7.9p1 Raspbian-10+deb10u4");
        assert_eq!(raspbian.distribution, "raspbian");
        assert_eq!(raspbian.distribution_version, "10");
    }

    #[test]
    fn windows_builds_carry_the_server_edition() {
        let facts = parse_openssh_banner("SSH-2.0-OpenSSH_for_Windows_9.8 Win32-OpenSSH-GitHub");
        assert_eq!(facts.platform, "windows");
        assert_eq!(facts.version, "9.8");
        assert_eq!(facts.distribution, "Microsoft Windows Server 2022");
        assert!(facts.cpe.is_empty());
    }

    #[test]
    fn cpe_encodes_version_and_patch_level() {
        let with_patch = parse_openssh_banner("SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13.8");
        assert_eq!(with_patch.cpe, "cpe:2.3:a:openbsd:openssh:9.6:p1:*:*:*:*:*:*");
        let plain = parse_openssh_banner("SSH-2.0-OpenSSH_9.3");
        assert_eq!(plain.cpe, "cpe:2.3:a:openbsd:openssh:9.3:-:*:*:*:*:*:*");
    }

    #[test]
    fn three_part_versions_are_not_truncated() {
        let facts = parse_openssh_banner("SSH-2.0-OpenSSH_6.6.1p1 Ubuntu-2ubuntu2");
        assert_eq!(facts.version, "6.6.1p1");
        assert_eq!(facts.distribution_version, "14.04");
    }

    #[test]
    fn non_openssh_banners_yield_nothing() {
        let facts = analyze_banner("SSH-2.0-dropbear_2022.83");
        assert_eq!(facts, BannerFacts::default());
    }
}
