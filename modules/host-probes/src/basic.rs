use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};
use tracing::debug;

/// Populates hostname, host id, arch, platform, distribution and uptime on
/// the local machine row. Values the OS does not expose are left empty,
/// never faked.
pub struct HostBasicModule;

#[async_trait]
impl Module for HostBasicModule {
    fn name(&self) -> &'static str {
        "host-basic"
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let mut host = ctx.store.get_or_create_host()?;

        if let Some(hostname) = read_hostname() {
            host.hostname = hostname;
        }
        if let Some(machine_id) = read_first(&["/etc/machine-id", "/var/lib/dbus/machine-id"]) {
            host.host_id = machine_id.trim().to_string();
        }
        host.arch = std::env::consts::ARCH.to_string();
        host.platform = std::env::consts::OS.to_string();

        if let Some(release) = read_first(&["/etc/os-release", "/usr/lib/os-release"]) {
            let os = OsRelease::parse(&release);
            host.distribution = os.id;
            host.distribution_version = os.version_id;
            host.distribution_family = os.family;
        }
        if let Some(uptime) = read_uptime_ns() {
            host.uptime_ns = Some(uptime);
        }

        debug!(
            hostname = %host.hostname,
            distribution = %host.distribution,
            family = %host.distribution_family,
            "host facts collected"
        );
        ctx.store.update_machine(&host)?;
        Ok(())
    }
}

fn read_first(paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| std::fs::read_to_string(p).ok())
}

fn read_hostname() -> Option<String> {
    read_first(&["/proc/sys/kernel/hostname", "/etc/hostname"])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `/proc/uptime` holds seconds with two decimals.
fn read_uptime_ns() -> Option<i64> {
    let text = std::fs::read_to_string("/proc/uptime").ok()?;
    let seconds: f64 = text.split_whitespace().next()?.parse().ok()?;
    Some((seconds * 1e9) as i64)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct OsRelease {
    id: String,
    version_id: String,
    family: String,
}

impl OsRelease {
    fn parse(text: &str) -> OsRelease {
        let mut out = OsRelease::default();
        let mut id_like = String::new();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else { continue };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "ID" => out.id = value,
                "VERSION_ID" => out.version_id = value,
                "ID_LIKE" => id_like = value,
                _ => {}
            }
        }
        // family: first ID_LIKE token, else the distribution id itself
        out.family = id_like
            .split_whitespace()
            .next()
            .unwrap_or(out.id.as_str())
            .to_string();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_family_prefers_id_like() {
        let text = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"24.04\"\n";
        let os = OsRelease::parse(text);
        assert_eq!(os.id, "ubuntu");
        assert_eq!(os.version_id, "24.04");
        assert_eq!(os.family, "debian");
    }

    #[test]
    fn os_release_family_falls_back_to_id() {
        let text = "ID=debian\nVERSION_ID=\"12\"\n";
        let os = OsRelease::parse(text);
        assert_eq!(os.family, "debian");
    }

    #[test]
    fn os_release_multiple_id_like_takes_first() {
        let text = "ID=centos\nID_LIKE=\"rhel fedora\"\n";
        assert_eq!(OsRelease::parse(text).family, "rhel");
    }
}
