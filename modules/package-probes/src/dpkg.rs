use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use situation_core::{Module, ModuleError, ScanContext};
use situation_store::Package;
use tracing::debug;

use crate::manager::{absorb_packages, keep_leaves, supported_host};

const FAMILIES: &[&str] = &["debian"];
const LOG_DIR: &str = "/var/log";
const INFO_DIR: &str = "/var/lib/dpkg/info";

/// Reads installed packages from the dpkg logs, for debian and derivatives.
///
/// `/var/log/dpkg.log*` gives name, version and install time;
/// `/var/lib/dpkg/info/<name>.list` gives the file list.
pub struct DpkgModule;

#[async_trait]
impl Module for DpkgModule {
    fn name(&self) -> &'static str {
        "dpkg"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["standard-protocol"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        if !cfg!(target_os = "linux") {
            return Err(ModuleError::not_applicable("dpkg exists on linux only"));
        }
        let host = supported_host(ctx, FAMILIES)?;
        let packages = installed_packages(Path::new(LOG_DIR), Path::new(INFO_DIR))
            .map_err(anyhow::Error::from)?;
        absorb_packages(ctx, host.id, "dpkg", packages)
    }
}

/// One `status installed` log line. Rotated logs are all read, so the same
/// package may appear several times; the caller keeps the latest entry.
fn parse_log_line(line: &str) -> Option<(i64, String, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"^(\d{4}-\d{2}-\d{2}) (\d{2}:\d{2}:\d{2}) status installed ([^\s:]+)(?::\S+)? (\S+)$",
        )
        .unwrap()
    });
    let caps = re.captures(line)?;
    let ts = parse_timestamp(&caps[1], &caps[2])?;
    Some((ts, caps[3].to_string(), caps[4].to_string()))
}

fn parse_timestamp(date: &str, clock: &str) -> Option<i64> {
    let fmt =
        time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").ok()?;
    let dt = time::PrimitiveDateTime::parse(&format!("{date} {clock}"), &fmt).ok()?;
    Some(dt.assume_utc().unix_timestamp())
}

fn installed_packages(log_dir: &Path, info_dir: &Path) -> std::io::Result<Vec<Package>> {
    let mut found: BTreeMap<(String, String), i64> = BTreeMap::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("dpkg.log") || !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (ts, name, version) in text.lines().filter_map(parse_log_line) {
            let slot = found.entry((name, version)).or_insert(ts);
            *slot = (*slot).max(ts);
        }
    }

    let mut packages = Vec::with_capacity(found.len());
    for ((name, version), ts) in found {
        let files = match package_files(info_dir, &name) {
            Ok(files) => keep_leaves(files),
            Err(e) => {
                debug!(package = %name, error = %e, "no file list");
                Vec::new()
            }
        };
        packages.push(Package {
            id: 0,
            machine_id: 0,
            name,
            version,
            vendor: String::new(),
            manager: String::new(),
            install_time_unix: Some(ts),
            files,
        });
    }
    Ok(packages)
}

/// File list of a package, from `<name>.list` or its arch-qualified
/// variant `<name>:<arch>.list`.
fn package_files(info_dir: &Path, name: &str) -> std::io::Result<Vec<String>> {
    let exact = info_dir.join(format!("{name}.list"));
    let path = if exact.is_file() {
        exact
    } else {
        let arch_prefix = format!("{name}:");
        std::fs::read_dir(info_dir)?
            .flatten()
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .and_then(|f| f.to_str())
                    .is_some_and(|f| f.starts_with(&arch_prefix) && f.ends_with(".list"))
            })
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no file list for {name}"),
                )
            })?
    };
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != "/.")
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
2022-11-29 08:46:43 status unpacked linux-generic:amd64 5.15.0.53.53
2022-11-29 08:46:43 status half-configured linux-generic:amd64 5.15.0.53.53
2022-11-29 08:46:43 status installed linux-generic:amd64 5.15.0.53.53
2022-11-29 08:46:43 trigproc libc-bin:amd64 2.35-0ubuntu3.1 <none>
2022-11-29 08:47:02 status installed openssh-server:amd64 1:9.6p1-3ubuntu13
";

    #[test]
    fn only_installed_status_lines_count() {
        let parsed: Vec<_> = LOG.lines().filter_map(parse_log_line).collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].1, "linux-generic");
        assert_eq!(parsed[0].2, "5.15.0.53.53");
        assert_eq!(parsed[1].1, "openssh-server");
        assert_eq!(parsed[1].2, "1:9.6p1-3ubuntu13");
        // 2022-11-29 08:47:02 UTC
        assert_eq!(parsed[1].0, 1669711622);
    }

    #[test]
    fn the_info_dir_provides_leaf_files() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        let info_dir = dir.path().join("info");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::create_dir_all(&info_dir).unwrap();
        std::fs::write(log_dir.join("dpkg.log"), LOG).unwrap();
        std::fs::write(log_dir.join("dpkg.log.1"), LOG).unwrap();
        std::fs::write(
            info_dir.join("openssh-server.list"),
            "/.\n/usr\n/usr/sbin\n/usr/sbin/sshd\n/etc/ssh/sshd_config\n",
        )
        .unwrap();

        let packages = installed_packages(&log_dir, &info_dir).unwrap();
        assert_eq!(packages.len(), 2);

        let ssh = packages.iter().find(|p| p.name == "openssh-server").unwrap();
        assert_eq!(ssh.version, "1:9.6p1-3ubuntu13");
        assert_eq!(
            ssh.files,
            vec!["/etc/ssh/sshd_config".to_string(), "/usr/sbin/sshd".to_string()]
        );
        // no .list file for linux-generic
        let lg = packages.iter().find(|p| p.name == "linux-generic").unwrap();
        assert!(lg.files.is_empty());
    }
}
