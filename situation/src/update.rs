//! Self-update from GitHub releases. The downloaded binary carries the
//! placeholder agent ID; it is patched with the current one before the swap
//! so the machine keeps its identity across versions.

use std::path::Path;

use anyhow::{bail, Context as _, Result};
use clap::Args;
use serde::Deserialize;
use tracing::{debug, info};

use crate::agent;

const DEFAULT_RELEASE_URL: &str = "https://api.github.com/repos/situation-sh/situation/releases";

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Accept a release with a different major or minor version
    #[arg(long)]
    pub force: bool,
    /// GitHub releases API endpoint
    #[arg(long, default_value = DEFAULT_RELEASE_URL)]
    pub release_url: String,
    /// Token sent as a bearer to the releases API
    #[arg(long, default_value = "")]
    pub release_token: String,
}

#[derive(Deserialize, Debug)]
struct Release {
    tag_name: String,
    draft: bool,
    prerelease: bool,
    assets: Vec<Asset>,
}

#[derive(Deserialize, Debug)]
struct Asset {
    name: String,
    browser_download_url: String,
}

/// Parses "v1.2.3" or "1.2.3" into a comparable triple.
fn parse_version(tag: &str) -> Option<(u64, u64, u64)> {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    let mut parts = tag.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    // tolerate suffixes like "3-rc1" on the patch component
    let patch = parts
        .next()?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;
    Some((major, minor, patch))
}

fn release_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Picks the newest eligible release: newer than `current`, not a draft or a
/// prerelease, and within the same major.minor unless `force` is set.
fn select_release(releases: Vec<Release>, current: (u64, u64, u64), force: bool) -> Option<Release> {
    let mut best: Option<(Release, (u64, u64, u64))> = None;
    for release in releases {
        if release.draft || release.prerelease {
            continue;
        }
        let Some(version) = parse_version(&release.tag_name) else {
            continue;
        };
        if version <= current {
            continue;
        }
        if !force && (version.0, version.1) != (current.0, current.1) {
            continue;
        }
        match &best {
            Some((_, v)) if *v >= version => {}
            _ => best = Some((release, version)),
        }
    }
    best.map(|(release, _)| release)
}

/// Replaces the first occurrence of `needle` in `haystack` in place.
fn patch_bytes(haystack: &mut [u8], needle: &[u8], replacement: &[u8]) -> bool {
    debug_assert_eq!(needle.len(), replacement.len());
    if let Some(at) = haystack
        .windows(needle.len())
        .position(|window| window == needle)
    {
        haystack[at..at + needle.len()].copy_from_slice(replacement);
        return true;
    }
    false
}

pub async fn update(args: &UpdateArgs) -> Result<()> {
    let current = parse_version(situation_core::version())
        .context("the running binary has no parseable version")?;

    let client = reqwest::Client::new();
    let mut request = client
        .get(&args.release_url)
        .header("Accept", "application/vnd.github+json")
        .header("User-Agent", "situation");
    if !args.release_token.is_empty() {
        request = request.bearer_auth(&args.release_token);
    }
    let releases: Vec<Release> = request.send().await?.error_for_status()?.json().await?;
    debug!(count = releases.len(), "releases fetched");

    let Some(release) = select_release(releases, current, args.force) else {
        info!("already up to date");
        return Ok(());
    };
    info!(tag = %release.tag_name, "release selected");

    let wanted_os = std::env::consts::OS;
    let wanted_arch = release_arch();
    let asset = release
        .assets
        .iter()
        .find(|a| a.name.contains(wanted_os) && a.name.contains(wanted_arch))
        .with_context(|| format!("no asset for {wanted_os}/{wanted_arch}"))?;

    info!(asset = %asset.name, "downloading");
    let mut binary = client
        .get(&asset.browser_download_url)
        .header("User-Agent", "situation")
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?
        .to_vec();

    // keep the identity of this install
    let id = agent::agent();
    if !patch_bytes(&mut binary, &agent::DEFAULT_ID, id.as_bytes()) {
        bail!("downloaded binary has no agent ID placeholder");
    }

    let exe = std::env::current_exe()?;
    swap_binary(&exe, &binary)?;
    info!(tag = %release.tag_name, path = %exe.display(), "updated");
    Ok(())
}

fn swap_binary(exe: &Path, binary: &[u8]) -> Result<()> {
    let dir = exe.parent().context("executable has no parent directory")?;
    let staged = dir.join(".situation.update");
    std::fs::write(&staged, binary)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))?;
    }
    std::fs::rename(&staged, exe)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_parse_and_compare() {
        assert_eq!(parse_version("v1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version("0.18.0"), Some((0, 18, 0)));
        assert_eq!(parse_version("v0.18.1-rc1"), Some((0, 18, 1)));
        assert_eq!(parse_version("nightly"), None);
        assert!(parse_version("v0.19.0") > parse_version("v0.18.9"));
    }

    fn release(tag: &str) -> Release {
        Release {
            tag_name: tag.to_string(),
            draft: false,
            prerelease: false,
            assets: vec![],
        }
    }

    #[test]
    fn selection_stays_within_the_minor_without_force() {
        let releases = vec![release("v0.18.2"), release("v0.19.0"), release("v0.18.3")];
        let picked = select_release(releases, (0, 18, 1), false).unwrap();
        assert_eq!(picked.tag_name, "v0.18.3");
    }

    #[test]
    fn selection_crosses_minors_with_force() {
        let releases = vec![release("v0.18.2"), release("v0.19.0")];
        let picked = select_release(releases, (0, 18, 1), true).unwrap();
        assert_eq!(picked.tag_name, "v0.19.0");
    }

    #[test]
    fn drafts_and_prereleases_are_skipped() {
        let mut draft = release("v0.18.5");
        draft.draft = true;
        let mut rc = release("v0.18.4");
        rc.prerelease = true;
        assert!(select_release(vec![draft, rc], (0, 18, 1), false).is_none());
    }

    #[test]
    fn the_placeholder_is_patched_in_place() {
        let mut blob = b"head\xca\xfe\xca\xfe\xca\xfe\xca\xfe\xca\xfe\xca\xfe\xca\xfe\xca\xfetail".to_vec();
        let id = [7u8; 16];
        assert!(patch_bytes(&mut blob, &agent::DEFAULT_ID, &id));
        assert_eq!(&blob[4..20], &id);
        assert!(!patch_bytes(&mut blob, &agent::DEFAULT_ID, &id));
    }
}
