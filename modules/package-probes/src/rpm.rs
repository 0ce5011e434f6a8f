use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags};
use situation_core::{Module, ModuleError, ScanContext};
use situation_store::Package;

use crate::manager::{absorb_packages, supported_host};
use crate::rpmdb::{parse_install_key, parse_package_blob};

const FAMILIES: &[&str] = &["fedora", "rhel", "suse", "neokylin", "anolis"];
const DEFAULT_PATH: &str = "/var/lib/rpm/rpmdb.sqlite";
const FALLBACK_DIR: &str = "/usr/lib";

/// Reads installed packages from the rpm database, for fedora, rhel and
/// derivatives. Modern rpm keeps its database in sqlite, so the module
/// reads `/var/lib/rpm/rpmdb.sqlite` (or finds it under `/usr/lib` on
/// ostree-style layouts) and decodes the raw header blobs itself.
pub struct RpmModule;

#[async_trait]
impl Module for RpmModule {
    fn name(&self) -> &'static str {
        "rpm"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["standard-protocol"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        if !cfg!(target_os = "linux") {
            return Err(ModuleError::not_applicable("rpm exists on linux only"));
        }
        let host = supported_host(ctx, FAMILIES)?;
        let path = find_db_file()?;
        let packages = read_database(&path)?;
        absorb_packages(ctx, host.id, "rpm", packages)
    }
}

fn find_db_file() -> Result<PathBuf> {
    let default = PathBuf::from(DEFAULT_PATH);
    if default.is_file() {
        return Ok(default);
    }
    if let Some(found) = find_file(Path::new(FALLBACK_DIR), "rpmdb.sqlite") {
        return Ok(found);
    }
    bail!("rpm database not found");
}

fn find_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(kind) = entry.file_type() else {
                continue;
            };
            if kind.is_dir() {
                stack.push(path);
            } else if kind.is_file() && entry.file_name() == name {
                return Some(path);
            }
        }
    }
    None
}

/// Reads the `Packages` table and joins `Installtid` on `hnum` for the
/// install timestamp. Rows whose blob does not decode are skipped.
pub(crate) fn read_database(path: &Path) -> Result<Vec<Package>> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut packages = conn.prepare("SELECT hnum, blob FROM Packages")?;
    let mut install = conn.prepare("SELECT key FROM Installtid WHERE hnum=? LIMIT 1")?;

    let rows = packages.query_map([], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (hnum, blob) = row?;
        let Some(mut pkg) = parse_package_blob(&blob) else {
            continue;
        };
        pkg.install_time_unix = install
            .query_row(params![hnum], |r| r.get::<_, Vec<u8>>(0))
            .ok()
            .and_then(|key| parse_install_key(&key));
        out.push(pkg);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // minimal valid header blob with just a NAME entry
    fn name_only_blob(name: &str) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&1u32.to_be_bytes());
        blob.extend_from_slice(&((name.len() + 1) as u32).to_be_bytes());
        blob.extend_from_slice(&1000u32.to_be_bytes()); // NAME
        blob.extend_from_slice(&6u32.to_be_bytes()); // STRING
        blob.extend_from_slice(&0u32.to_be_bytes());
        blob.extend_from_slice(&1u32.to_be_bytes());
        blob.extend_from_slice(name.as_bytes());
        blob.push(0);
        blob
    }

    #[test]
    fn the_database_layout_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpmdb.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Packages (hnum INTEGER PRIMARY KEY, blob BLOB);
             CREATE TABLE Installtid (key BLOB, hnum INTEGER, idx INTEGER);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO Packages (hnum, blob) VALUES (1, ?)",
            params![name_only_blob("bash")],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO Installtid (key, hnum, idx) VALUES (?, 1, 0)",
            params![vec![0x4eu8, 0x61, 0xbc, 0x00]],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO Packages (hnum, blob) VALUES (2, x'00')",
            [],
        )
        .unwrap();
        drop(conn);

        let packages = read_database(&path).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "bash");
        assert_eq!(packages[0].install_time_unix, Some(0x00bc614e));
    }

    #[test]
    fn nested_files_are_found() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sysimage").join("rpm");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("rpmdb.sqlite"), b"").unwrap();

        let found = find_file(dir.path(), "rpmdb.sqlite").unwrap();
        assert_eq!(found, nested.join("rpmdb.sqlite"));
        assert!(find_file(dir.path(), "missing.sqlite").is_none());
    }
}
