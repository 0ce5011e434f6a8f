use std::collections::HashMap;

use anyhow::Result;
use rusqlite::params;

use crate::models::*;
use crate::open::{now, Store};

impl Store {
    pub fn upsert_package(&self, pkg: &mut Package) -> Result<PackageId> {
        let files = serde_json::to_string(&pkg.files)?;
        let ts = now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO packages(machine_id, name, version, vendor, manager, install_time_unix, files, created_at, updated_at)
             VALUES (?,?,?,?,?,?,?,?,?)
             ON CONFLICT(machine_id, name, version) DO UPDATE SET
               vendor=CASE WHEN excluded.vendor<>'' THEN excluded.vendor ELSE packages.vendor END,
               install_time_unix=COALESCE(excluded.install_time_unix, packages.install_time_unix),
               files=CASE WHEN excluded.files<>'[]' THEN excluded.files ELSE packages.files END,
               updated_at=excluded.updated_at",
            params![
                pkg.machine_id, pkg.name, pkg.version, pkg.vendor, pkg.manager,
                pkg.install_time_unix, files, ts, ts
            ],
        )?;
        let id: PackageId = conn.query_row(
            "SELECT id FROM packages WHERE machine_id=? AND name=? AND version=?",
            params![pkg.machine_id, pkg.name, pkg.version],
            |r| r.get(0),
        )?;
        pkg.id = id;
        Ok(id)
    }

    pub fn bulk_upsert_packages(&self, pkgs: &mut [Package]) -> Result<()> {
        for pkg in pkgs.iter_mut() {
            self.upsert_package(pkg)?;
        }
        Ok(())
    }

    pub fn packages_by_machine(&self, machine_id: MachineId) -> Result<Vec<Package>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, machine_id, name, version, vendor, manager, install_time_unix, files
             FROM packages WHERE machine_id=? ORDER BY id",
        )?;
        let rows = stmt.query_map(params![machine_id], |r| {
            let files: String = r.get(7)?;
            Ok(Package {
                id: r.get(0)?,
                machine_id: r.get(1)?,
                name: r.get(2)?,
                version: r.get(3)?,
                vendor: r.get(4)?,
                manager: r.get(5)?,
                install_time_unix: r.get(6)?,
                files: serde_json::from_str(&files).unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Map from executable path to the local applications using that path as
    /// name. Package probes use it to wire `package_id` on file matches.
    pub fn file_application_map(&self, machine_id: MachineId) -> Result<HashMap<String, Vec<ApplicationId>>> {
        let mut map: HashMap<String, Vec<ApplicationId>> = HashMap::new();
        for app in self.applications_by_machine(machine_id)? {
            if app.name.is_empty() {
                continue;
            }
            map.entry(app.name.clone()).or_default().push(app.id);
        }
        Ok(map)
    }
}
