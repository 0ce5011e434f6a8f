use anyhow::Result;
use ipnet::IpNet;
use rusqlite::{params, Row};

use crate::models::*;
use crate::open::{now, Store};

pub(crate) fn nic_from_row(row: &Row<'_>) -> rusqlite::Result<NetworkInterface> {
    let ips: String = row.get("ip")?;
    let flags: String = row.get("flags")?;
    Ok(NetworkInterface {
        id: row.get("id")?,
        machine_id: row.get("machine_id")?,
        name: row.get("name")?,
        mac: row.get("mac")?,
        mac_vendor: row.get("mac_vendor")?,
        ips: serde_json::from_str(&ips).unwrap_or_default(),
        gateway: row.get("gateway")?,
        flags: serde_json::from_str(&flags).unwrap_or_default(),
        tag: row.get("tag")?,
    })
}

const NIC_COLS: &str = "id, machine_id, name, mac, mac_vendor, ip, gateway, flags, tag";

impl Store {
    /// Inserts or merges a NIC. Rows attached to a machine key on
    /// (machine_id, name) when the name is known, else on
    /// (machine_id, mac, tag); detached rows are plain inserts and stay
    /// orphan until adoption. Empty incoming fields never erase stored ones.
    pub fn upsert_nic(&self, nic: &mut NetworkInterface) -> Result<NicId> {
        nic.mac = normalize_mac(&nic.mac);
        let ips = serde_json::to_string(&nic.ips)?;
        let flags = serde_json::to_string(&nic.flags)?;
        let ts = now();
        let conn = self.conn();

        let Some(machine_id) = nic.machine_id else {
            conn.execute(
                "INSERT INTO network_interfaces(machine_id, name, mac, mac_vendor, ip, gateway, flags, tag, created_at, updated_at)
                 VALUES (NULL,?,?,?,?,?,?,?,?,?)",
                params![nic.name, nic.mac, nic.mac_vendor, ips, nic.gateway, flags, nic.tag, ts, ts],
            )?;
            nic.id = conn.last_insert_rowid();
            return Ok(nic.id);
        };

        let (conflict, select) = if nic.name.is_empty() {
            (
                "ON CONFLICT(machine_id, mac, tag)",
                "SELECT id FROM network_interfaces WHERE machine_id=? AND mac=? AND tag=?",
            )
        } else {
            (
                "ON CONFLICT(machine_id, name)",
                "SELECT id FROM network_interfaces WHERE machine_id=? AND name=?",
            )
        };
        let sql = format!(
            "INSERT INTO network_interfaces(machine_id, name, mac, mac_vendor, ip, gateway, flags, tag, created_at, updated_at)
             VALUES (?,?,?,?,?,?,?,?,?,?)
             {conflict} DO UPDATE SET
               name=CASE WHEN excluded.name<>'' THEN excluded.name ELSE network_interfaces.name END,
               mac=CASE WHEN excluded.mac<>'' THEN excluded.mac ELSE network_interfaces.mac END,
               mac_vendor=COALESCE(excluded.mac_vendor, network_interfaces.mac_vendor),
               ip=CASE WHEN excluded.ip<>'[]' THEN excluded.ip ELSE network_interfaces.ip END,
               gateway=CASE WHEN excluded.gateway<>'' THEN excluded.gateway ELSE network_interfaces.gateway END,
               flags=excluded.flags,
               updated_at=excluded.updated_at"
        );
        conn.execute(
            &sql,
            params![machine_id, nic.name, nic.mac, nic.mac_vendor, ips, nic.gateway, flags, nic.tag, ts, ts],
        )?;
        let id: NicId = if nic.name.is_empty() {
            conn.query_row(select, params![machine_id, nic.mac, nic.tag], |r| r.get(0))?
        } else {
            conn.query_row(select, params![machine_id, nic.name], |r| r.get(0))?
        };
        nic.id = id;
        Ok(id)
    }

    pub fn get_nic(&self, id: NicId) -> Result<NetworkInterface> {
        let conn = self.conn();
        Ok(conn.query_row(
            &format!("SELECT {NIC_COLS} FROM network_interfaces WHERE id=?"),
            params![id],
            nic_from_row,
        )?)
    }

    pub fn nics_by_machine(&self, machine_id: MachineId) -> Result<Vec<NetworkInterface>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NIC_COLS} FROM network_interfaces WHERE machine_id=? ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![machine_id], nic_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// First NIC carrying `ip` in its address list, if any.
    pub fn nic_by_ip(&self, ip: &str) -> Result<Option<NetworkInterface>> {
        let member = self.dialect().array_contains("ip", "?1");
        let conn = self.conn();
        let sql = format!(
            "SELECT {NIC_COLS} FROM network_interfaces WHERE {member} ORDER BY id LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![ip], nic_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn nic_by_mac(&self, mac: &str) -> Result<Option<NetworkInterface>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NIC_COLS} FROM network_interfaces WHERE mac=? ORDER BY id LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![normalize_mac(mac)], nic_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// NICs that do not belong to `host`: neighbour machines and orphan
    /// entries discovery has not attached yet.
    pub fn neighbour_nics(&self, host: MachineId) -> Result<Vec<NetworkInterface>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NIC_COLS} FROM network_interfaces
             WHERE machine_id IS NULL OR machine_id <> ? ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![host], nic_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every IP currently attached to any NIC, flattened.
    pub fn all_known_ips(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT ip FROM network_interfaces")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            let list: Vec<String> = serde_json::from_str(&raw?).unwrap_or_default();
            out.extend(list.into_iter().map(|ip| strip_prefix_len(&ip)));
        }
        Ok(out)
    }

    pub fn set_nic_ips(&self, id: NicId, ips: &[String]) -> Result<()> {
        self.conn().execute(
            "UPDATE network_interfaces SET ip=?, updated_at=? WHERE id=?",
            params![serde_json::to_string(ips)?, now(), id],
        )?;
        Ok(())
    }

    pub fn set_nic_mac(&self, id: NicId, mac: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE network_interfaces SET mac=?, updated_at=? WHERE id=?",
            params![normalize_mac(mac), now(), id],
        )?;
        Ok(())
    }

    /// NICs with a MAC but no resolved vendor yet.
    pub fn nics_missing_vendor(&self) -> Result<Vec<(NicId, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, mac FROM network_interfaces WHERE mac_vendor IS NULL AND mac <> ''",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_mac_vendor(&self, id: NicId, vendor: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE network_interfaces SET mac_vendor=?, updated_at=? WHERE id=?",
            params![vendor, now(), id],
        )?;
        Ok(())
    }

    /// Adopts every detached NIC by giving it a fresh stub machine. Runs
    /// unconditionally at the end of each scan.
    pub fn ensure_no_orphan_nics(&self) -> Result<usize> {
        let orphans: Vec<NicId> = {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT id FROM network_interfaces WHERE machine_id IS NULL")?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for nic_id in &orphans {
            let machine_id = self.new_empty_machine()?;
            self.conn().execute(
                "UPDATE network_interfaces SET machine_id=?, updated_at=? WHERE id=?",
                params![machine_id, now(), nic_id],
            )?;
        }
        if !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "adopted orphan network interfaces");
        }
        Ok(orphans.len())
    }

    /// Upserts the canonical form of `net` and returns its id.
    pub fn get_or_create_subnetwork(&self, net: &IpNet, gateway: &str, vlan: Option<i64>) -> Result<SubnetId> {
        let canon = net.trunc();
        let cidr = canon.to_string();
        let ts = now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO subnetworks(network_cidr, network_addr, mask_size, ip_version, gateway, vlan, created_at, updated_at)
             VALUES (?,?,?,?,?,?,?,?)
             ON CONFLICT(network_cidr) DO UPDATE SET
               gateway=CASE WHEN excluded.gateway<>'' THEN excluded.gateway ELSE subnetworks.gateway END,
               vlan=COALESCE(excluded.vlan, subnetworks.vlan),
               updated_at=excluded.updated_at",
            params![
                cidr,
                canon.network().to_string(),
                canon.prefix_len() as i64,
                if canon.network().is_ipv4() { 4i64 } else { 6i64 },
                gateway,
                vlan,
                ts,
                ts
            ],
        )?;
        let id: SubnetId = conn.query_row(
            "SELECT id FROM subnetworks WHERE network_cidr=?",
            params![cidr],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn link_nic_subnet(&self, nic_id: NicId, subnet_id: SubnetId) -> Result<()> {
        self.conn().execute(
            "INSERT INTO network_interface_subnets(network_interface_id, subnetwork_id)
             VALUES (?,?) ON CONFLICT DO NOTHING",
            params![nic_id, subnet_id],
        )?;
        Ok(())
    }

    pub fn all_ipv4_networks(&self) -> Result<Vec<Subnetwork>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, network_cidr, network_addr, mask_size, ip_version, gateway, vlan
             FROM subnetworks WHERE ip_version=4 ORDER BY id",
        )?;
        let rows = stmt.query_map([], subnet_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn subnets_of_nic(&self, nic_id: NicId) -> Result<Vec<Subnetwork>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.network_cidr, s.network_addr, s.mask_size, s.ip_version, s.gateway, s.vlan
             FROM subnetworks s
             JOIN network_interface_subnets l ON l.subnetwork_id = s.id
             WHERE l.network_interface_id = ? ORDER BY s.id",
        )?;
        let rows = stmt.query_map(params![nic_id], subnet_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn subnet_from_row(row: &Row<'_>) -> rusqlite::Result<Subnetwork> {
    Ok(Subnetwork {
        id: row.get(0)?,
        cidr: row.get(1)?,
        network_addr: row.get(2)?,
        mask_size: row.get::<_, i64>(3)? as u8,
        ip_version: row.get::<_, i64>(4)? as u8,
        gateway: row.get(5)?,
        vlan: row.get(6)?,
    })
}

/// `10.0.2.15/24` -> `10.0.2.15`; bare addresses pass through.
pub fn strip_prefix_len(ip: &str) -> String {
    match ip.split_once('/') {
        Some((addr, _)) => addr.to_string(),
        None => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn store() -> Store {
        Store::open_in_memory(Uuid::new_v4()).unwrap()
    }

    fn nic(machine_id: Option<MachineId>, name: &str, mac: &str, ips: &[&str]) -> NetworkInterface {
        NetworkInterface {
            machine_id,
            name: name.into(),
            mac: mac.into(),
            ips: ips.iter().map(|s| s.to_string()).collect(),
            flags: NicFlags { up: true, running: true, ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn nic_upsert_keys_on_machine_and_name() {
        let store = store();
        let host = store.get_or_create_host().unwrap();
        let mut a = nic(Some(host.id), "eth0", "52:54:00:12:34:56", &["10.0.2.15/24"]);
        let mut b = nic(Some(host.id), "eth0", "", &[]);
        let id_a = store.upsert_nic(&mut a).unwrap();
        let id_b = store.upsert_nic(&mut b).unwrap();
        assert_eq!(id_a, id_b);
        let back = store.get_nic(id_a).unwrap();
        // the empty re-insert did not erase anything
        assert_eq!(back.mac, "52:54:00:12:34:56");
        assert_eq!(back.ips, vec!["10.0.2.15/24"]);
    }

    #[test]
    fn nameless_nic_keys_on_mac() {
        let store = store();
        let host = store.get_or_create_host().unwrap();
        let mut a = nic(Some(host.id), "", "aa:bb:cc:00:11:22", &["192.168.1.7"]);
        let mut b = nic(Some(host.id), "", "AA:BB:CC:00:11:22", &["192.168.1.7"]);
        assert_eq!(store.upsert_nic(&mut a).unwrap(), store.upsert_nic(&mut b).unwrap());
    }

    #[test]
    fn nic_lookup_by_ip_uses_array_membership() {
        let store = store();
        let host = store.get_or_create_host().unwrap();
        let mut a = nic(Some(host.id), "eth0", "52:54:00:12:34:56", &["10.0.2.15", "fe80::1"]);
        store.upsert_nic(&mut a).unwrap();
        assert!(store.nic_by_ip("10.0.2.15").unwrap().is_some());
        assert!(store.nic_by_ip("10.0.2.16").unwrap().is_none());
    }

    #[test]
    fn orphan_adoption_creates_one_stub_per_nic() {
        let store = store();
        let mut a = nic(None, "", "aa:aa:aa:00:00:01", &["10.0.0.8"]);
        let mut b = nic(None, "", "aa:aa:aa:00:00:02", &["10.0.0.9"]);
        store.upsert_nic(&mut a).unwrap();
        store.upsert_nic(&mut b).unwrap();
        assert_eq!(store.ensure_no_orphan_nics().unwrap(), 2);
        assert_eq!(store.ensure_no_orphan_nics().unwrap(), 0);
        for id in [a.id, b.id] {
            assert!(store.get_nic(id).unwrap().machine_id.is_some());
        }
        // two stubs, no sharing
        let m_a = store.get_nic(a.id).unwrap().machine_id;
        let m_b = store.get_nic(b.id).unwrap().machine_id;
        assert_ne!(m_a, m_b);
    }

    #[test]
    fn subnetwork_is_canonicalized() {
        let store = store();
        let net: IpNet = "10.0.2.15/24".parse().unwrap();
        let id = store.get_or_create_subnetwork(&net, "", None).unwrap();
        let nets = store.all_ipv4_networks().unwrap();
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0].id, id);
        assert_eq!(nets[0].cidr, "10.0.2.0/24");
        assert_eq!(nets[0].network_addr, "10.0.2.0");
        assert_eq!(nets[0].mask_size, 24);
        // same subnet again
        let again: IpNet = "10.0.2.99/24".parse().unwrap();
        assert_eq!(store.get_or_create_subnetwork(&again, "", None).unwrap(), id);
    }

    #[test]
    fn mac_vendor_selection_skips_resolved_and_empty() {
        let store = store();
        let host = store.get_or_create_host().unwrap();
        let mut a = nic(Some(host.id), "eth0", "52:54:00:12:34:56", &[]);
        let mut b = nic(Some(host.id), "lo", "", &[]);
        store.upsert_nic(&mut a).unwrap();
        store.upsert_nic(&mut b).unwrap();
        let missing = store.nics_missing_vendor().unwrap();
        assert_eq!(missing.len(), 1);
        store.set_mac_vendor(missing[0].0, "QEMU").unwrap();
        assert!(store.nics_missing_vendor().unwrap().is_empty());
    }
}
