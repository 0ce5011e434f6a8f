use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::*;
use crate::open::{now, Store};

pub(crate) fn machine_from_row(row: &Row<'_>) -> rusqlite::Result<Machine> {
    let agent: Option<String> = row.get("agent")?;
    Ok(Machine {
        id: row.get("id")?,
        hostname: row.get("hostname")?,
        host_id: row.get("host_id")?,
        arch: row.get("arch")?,
        platform: row.get("platform")?,
        distribution: row.get("distribution")?,
        distribution_version: row.get("distribution_version")?,
        distribution_family: row.get("distribution_family")?,
        uptime_ns: row.get("uptime_ns")?,
        chassis: row.get("chassis")?,
        cpe: row.get("cpe")?,
        agent: agent.and_then(|a| Uuid::parse_str(&a).ok()),
        parent_machine_id: row.get("parent_machine_id")?,
    })
}

const MACHINE_COLS: &str = "id, hostname, host_id, arch, platform, distribution, \
     distribution_version, distribution_family, uptime_ns, chassis, cpe, agent, parent_machine_id";

impl Store {
    /// Returns the machine that carries this agent's UUID, creating it on
    /// first call. The id is cached for the rest of the scan.
    pub fn get_or_create_host(&self) -> Result<Machine> {
        if let Some(id) = self.cached_host_id() {
            if let Ok(m) = self.get_machine(id) {
                return Ok(m);
            }
        }
        let agent = self.agent().to_string();
        let ts = now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO machines(agent, created_at, updated_at) VALUES (?,?,?)
             ON CONFLICT(agent) DO UPDATE SET updated_at=excluded.updated_at",
            params![agent, ts, ts],
        )?;
        let machine = conn.query_row(
            &format!("SELECT {MACHINE_COLS} FROM machines WHERE agent=?"),
            params![agent],
            machine_from_row,
        )?;
        drop(conn);
        self.cache_host_id(machine.id);
        Ok(machine)
    }

    pub fn get_machine(&self, id: MachineId) -> Result<Machine> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {MACHINE_COLS} FROM machines WHERE id=?"),
            params![id],
            machine_from_row,
        )
        .with_context(|| format!("machine {id} not found"))
    }

    /// Bare machine row, used for neighbours known only by L2/L3 evidence.
    pub fn new_empty_machine(&self) -> Result<MachineId> {
        let ts = now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO machines(created_at, updated_at) VALUES (?,?)",
            params![ts, ts],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Writes every descriptive field of `machine` back to its row.
    pub fn update_machine(&self, machine: &Machine) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE machines SET hostname=?, host_id=?, arch=?, platform=?, distribution=?,
             distribution_version=?, distribution_family=?, uptime_ns=?, chassis=?, cpe=?,
             parent_machine_id=?, updated_at=? WHERE id=?",
            params![
                machine.hostname,
                machine.host_id,
                machine.arch,
                machine.platform,
                machine.distribution,
                machine.distribution_version,
                machine.distribution_family,
                machine.uptime_ns,
                machine.chassis,
                machine.cpe,
                machine.parent_machine_id,
                now(),
                machine.id,
            ],
        )?;
        Ok(())
    }

    pub fn set_hostname(&self, id: MachineId, hostname: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE machines SET hostname=?, updated_at=? WHERE id=?",
            params![hostname, now(), id],
        )?;
        Ok(())
    }

    pub fn set_chassis(&self, id: MachineId, chassis: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE machines SET chassis=?, updated_at=? WHERE id=?",
            params![chassis, now(), id],
        )?;
        Ok(())
    }

    pub fn all_machines(&self) -> Result<Vec<Machine>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {MACHINE_COLS} FROM machines ORDER BY id"))?;
        let rows = stmt.query_map([], machine_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Lookup by stable platform identifier (machine-id, container id, VM
    /// instance uuid).
    pub fn machine_by_host_id(&self, host_id: &str) -> Result<Option<Machine>> {
        if host_id.is_empty() {
            return Ok(None);
        }
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!("SELECT {MACHINE_COLS} FROM machines WHERE host_id=?"),
                params![host_id],
                machine_from_row,
            )
            .optional()?)
    }

    pub fn machines_without_hostname(&self) -> Result<Vec<Machine>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MACHINE_COLS} FROM machines WHERE hostname='' ORDER BY id"
        ))?;
        let rows = stmt.query_map([], machine_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Child machine (container, VM) keyed on (parent, hostname).
    pub fn get_or_create_child(&self, parent: MachineId, hostname: &str) -> Result<Machine> {
        let ts = now();
        let conn = self.conn();
        let found = conn
            .query_row(
                &format!(
                    "SELECT {MACHINE_COLS} FROM machines WHERE parent_machine_id=? AND hostname=?"
                ),
                params![parent, hostname],
                machine_from_row,
            )
            .optional()?;
        if let Some(m) = found {
            return Ok(m);
        }
        conn.execute(
            "INSERT INTO machines(hostname, parent_machine_id, created_at, updated_at) VALUES (?,?,?,?)",
            params![hostname, parent, ts, ts],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_machine(id)
    }

    pub fn upsert_cpu(&self, machine_id: MachineId, model: &str, vendor: &str, cores: i64) -> Result<()> {
        let ts = now();
        self.conn().execute(
            "INSERT INTO cpus(machine_id, model, vendor, cores, created_at, updated_at)
             VALUES (?,?,?,?,?,?)
             ON CONFLICT(machine_id) DO UPDATE SET model=excluded.model,
             vendor=excluded.vendor, cores=excluded.cores, updated_at=excluded.updated_at",
            params![machine_id, model, vendor, cores, ts, ts],
        )?;
        Ok(())
    }

    pub fn upsert_gpu(&self, gpu: &Gpu) -> Result<()> {
        let ts = now();
        self.conn().execute(
            "INSERT INTO gpus(machine_id, idx, product, vendor, driver, created_at, updated_at)
             VALUES (?,?,?,?,?,?,?)
             ON CONFLICT(machine_id, idx) DO UPDATE SET product=excluded.product,
             vendor=excluded.vendor, driver=excluded.driver, updated_at=excluded.updated_at",
            params![gpu.machine_id, gpu.index, gpu.product, gpu.vendor, gpu.driver, ts, ts],
        )?;
        Ok(())
    }

    pub fn upsert_disk(&self, disk: &Disk) -> Result<i64> {
        let ts = now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO disks(machine_id, name, size, disk_type, controller, created_at, updated_at)
             VALUES (?,?,?,?,?,?,?)
             ON CONFLICT(machine_id, name) DO UPDATE SET size=excluded.size,
             disk_type=excluded.disk_type, controller=excluded.controller,
             updated_at=excluded.updated_at",
            params![
                disk.machine_id,
                disk.name,
                disk.size,
                disk.disk_type.as_str(),
                disk.controller.as_str(),
                ts,
                ts
            ],
        )?;
        let disk_id: i64 = conn.query_row(
            "SELECT id FROM disks WHERE machine_id=? AND name=?",
            params![disk.machine_id, disk.name],
            |r| r.get(0),
        )?;
        for part in &disk.partitions {
            conn.execute(
                "INSERT INTO partitions(disk_id, name, size, part_type, read_only)
                 VALUES (?,?,?,?,?)
                 ON CONFLICT(disk_id, name) DO UPDATE SET size=excluded.size,
                 part_type=excluded.part_type, read_only=excluded.read_only",
                params![disk_id, part.name, part.size, part.part_type, part.read_only as i64],
            )?;
        }
        Ok(disk_id)
    }

    pub fn upsert_user(&self, machine_id: MachineId, uid: &str, username: &str) -> Result<UserId> {
        let ts = now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users(machine_id, uid, username, created_at, updated_at)
             VALUES (?,?,?,?,?)
             ON CONFLICT(machine_id, uid) DO UPDATE SET username=excluded.username,
             updated_at=excluded.updated_at",
            params![machine_id, uid, username, ts, ts],
        )?;
        let id: UserId = conn.query_row(
            "SELECT id FROM users WHERE machine_id=? AND uid=?",
            params![machine_id, uid],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn users_by_machine(&self, machine_id: MachineId) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, machine_id, uid, username FROM users WHERE machine_id=? ORDER BY id",
        )?;
        let rows = stmt.query_map(params![machine_id], |r| {
            Ok(User {
                id: r.get(0)?,
                machine_id: r.get(1)?,
                uid: r.get(2)?,
                username: r.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory(Uuid::new_v4()).unwrap()
    }

    #[test]
    fn get_or_create_host_is_idempotent() {
        let store = store();
        let a = store.get_or_create_host().unwrap();
        let b = store.get_or_create_host().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.agent, Some(store.agent()));
        assert_eq!(store.all_machines().unwrap().len(), 1);
    }

    #[test]
    fn update_machine_round_trips() {
        let store = store();
        let mut host = store.get_or_create_host().unwrap();
        host.hostname = "box".into();
        host.host_id = "5dc3f26c-0f3e-4e69-8e26-24eb1e0e300e".into();
        host.platform = "linux".into();
        host.distribution_family = "debian".into();
        host.uptime_ns = Some(42_000_000_000);
        store.update_machine(&host).unwrap();
        let back = store.get_machine(host.id).unwrap();
        assert_eq!(back.hostname, "box");
        assert_eq!(back.uptime_ns, Some(42_000_000_000));
        assert_eq!(back.agent, Some(store.agent()));
    }

    #[test]
    fn unknown_host_id_is_none_not_an_error() {
        let store = store();
        store.get_or_create_host().unwrap();
        assert!(store.machine_by_host_id("no-such-host-id").unwrap().is_none());
        assert!(store.machine_by_host_id("").unwrap().is_none());
    }

    #[test]
    fn child_machines_key_on_parent_and_hostname() {
        let store = store();
        let host = store.get_or_create_host().unwrap();
        let c1 = store.get_or_create_child(host.id, "web-1").unwrap();
        let c2 = store.get_or_create_child(host.id, "web-1").unwrap();
        assert_eq!(c1.id, c2.id);
        assert_eq!(c1.parent_machine_id, Some(host.id));
    }

    #[test]
    fn hardware_upserts_do_not_duplicate() {
        let store = store();
        let host = store.get_or_create_host().unwrap();
        store.upsert_cpu(host.id, "EPYC 7543", "AMD", 32).unwrap();
        store.upsert_cpu(host.id, "EPYC 7543", "AMD", 64).unwrap();
        let cores: i64 = store
            .conn()
            .query_row("SELECT cores FROM cpus WHERE machine_id=?", params![host.id], |r| r.get(0))
            .unwrap();
        assert_eq!(cores, 64);

        let disk = Disk {
            id: 0,
            machine_id: host.id,
            name: "nvme0n1".into(),
            size: 512 * 1024 * 1024 * 1024,
            disk_type: DiskType::Ssd,
            controller: DiskController::Nvme,
            partitions: vec![Partition {
                name: "nvme0n1p1".into(),
                size: 1024 * 1024 * 512,
                part_type: "vfat".into(),
                read_only: false,
            }],
        };
        let d1 = store.upsert_disk(&disk).unwrap();
        let d2 = store.upsert_disk(&disk).unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn user_upsert_keys_on_machine_and_uid() {
        let store = store();
        let host = store.get_or_create_host().unwrap();
        let u1 = store.upsert_user(host.id, "1000", "alice").unwrap();
        let u2 = store.upsert_user(host.id, "1000", "alice").unwrap();
        assert_eq!(u1, u2);
        assert_eq!(store.users_by_machine(host.id).unwrap().len(), 1);
    }
}
