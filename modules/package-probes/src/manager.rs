//! Skeleton shared by the package manager probes.

use std::collections::HashMap;

use situation_core::{ModuleError, ScanContext};
use situation_store::{Machine, Package};
use tracing::{debug, info, warn};

/// Gate on the host's distribution family. An empty family (not detected,
/// or a non-Linux host) lets the probe try anyway, as the original files
/// simply will not be there.
pub(crate) fn supported_host(
    ctx: &ScanContext,
    families: &[&str],
) -> Result<Machine, ModuleError> {
    let host = ctx.store.get_or_create_host()?;
    if !host.distribution_family.is_empty()
        && !families.contains(&host.distribution_family.as_str())
    {
        return Err(ModuleError::not_applicable(format!(
            "distribution family {} not handled",
            host.distribution_family
        )));
    }
    Ok(host)
}

/// Persists the packages of one manager and links every application whose
/// executable path appears in a package file list.
pub(crate) fn absorb_packages(
    ctx: &ScanContext,
    host: i64,
    manager: &str,
    mut packages: Vec<Package>,
) -> Result<(), ModuleError> {
    let mut file_apps: HashMap<String, Vec<i64>> = HashMap::new();
    for app in ctx.store.applications_by_machine(host)? {
        if !app.name.is_empty() {
            file_apps.entry(app.name.clone()).or_default().push(app.id);
        }
    }

    for pkg in packages.iter_mut() {
        pkg.machine_id = host;
        pkg.manager = manager.to_string();
    }
    ctx.store.bulk_upsert_packages(&mut packages)?;

    let mut linked = 0usize;
    for pkg in &packages {
        for file in &pkg.files {
            let Some(apps) = file_apps.get(file) else {
                continue;
            };
            for app in apps {
                debug!(app, file = %file, package = %pkg.name, "application linked");
                ctx.store.link_application_package(*app, pkg.id)?;
                linked += 1;
            }
        }
    }
    if linked == 0 {
        warn!(manager, "no applications to link to packages");
    }
    info!(manager, packages = packages.len(), linked, "packages absorbed");
    Ok(())
}

/// Sorts the paths and drops every directory that is an ancestor of another
/// entry, keeping only the leaf files.
pub(crate) fn keep_leaves(mut files: Vec<String>) -> Vec<String> {
    files.sort();
    files.dedup();
    let mut out = Vec::with_capacity(files.len());
    for i in 0..files.len() {
        let covers_next = files
            .get(i + 1)
            .and_then(|next| next.strip_prefix(files[i].as_str()))
            .is_some_and(|rest| rest.starts_with('/'));
        if !covers_next {
            out.push(files[i].clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_are_dropped() {
        let files = vec![
            "/usr".to_string(),
            "/usr/sbin".to_string(),
            "/usr/sbin/sshd".to_string(),
            "/etc/ssh/sshd_config".to_string(),
        ];
        assert_eq!(
            keep_leaves(files),
            vec!["/etc/ssh/sshd_config".to_string(), "/usr/sbin/sshd".to_string()]
        );
    }

    #[test]
    fn sibling_prefixes_survive() {
        // /usr/sbin is a string prefix of /usr/sbin2/x but not its parent
        let files = vec!["/usr/sbin".to_string(), "/usr/sbin2/x".to_string()];
        assert_eq!(keep_leaves(files.clone()), files);
    }

    #[test]
    fn short_lists_pass_through() {
        assert!(keep_leaves(vec![]).is_empty());
        assert_eq!(keep_leaves(vec!["/a".into()]), vec!["/a".to_string()]);
    }
}
