use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

use crate::models::*;
use crate::open::{now, Store};

pub(crate) fn application_from_row(row: &Row<'_>) -> rusqlite::Result<Application> {
    let config: String = row.get("config")?;
    Ok(Application {
        id: row.get("id")?,
        machine_id: row.get("machine_id")?,
        package_id: row.get("package_id")?,
        name: row.get("name")?,
        args: row.get("args")?,
        pid: row.get("pid")?,
        version: row.get("version")?,
        protocol: row.get("protocol")?,
        cpe: row.get("cpe")?,
        config: serde_json::from_str(&config).unwrap_or_default(),
    })
}

pub(crate) fn endpoint_from_row(row: &Row<'_>) -> rusqlite::Result<ApplicationEndpoint> {
    let protocols: Option<String> = row.get("application_protocols")?;
    let tls: Option<String> = row.get("tls")?;
    let fingerprints: Option<String> = row.get("fingerprints")?;
    let protocol: String = row.get("protocol")?;
    Ok(ApplicationEndpoint {
        id: row.get("id")?,
        application_id: row.get("application_id")?,
        network_interface_id: row.get("network_interface_id")?,
        addr: row.get("addr")?,
        port: row.get::<_, i64>("port")? as u16,
        protocol: protocol.parse().unwrap_or(Protocol::Tcp),
        application_protocols: protocols.and_then(|p| serde_json::from_str(&p).ok()),
        saas: row.get("saas")?,
        tls: tls.and_then(|t| serde_json::from_str(&t).ok()),
        fingerprints: fingerprints.and_then(|f| serde_json::from_str(&f).ok()),
    })
}

const APP_COLS: &str =
    "id, machine_id, package_id, name, args, pid, version, protocol, cpe, config";
const EP_COLS: &str = "id, application_id, network_interface_id, addr, port, protocol, \
     application_protocols, saas, tls, fingerprints";

impl Store {
    pub fn upsert_application(&self, app: &mut Application) -> Result<ApplicationId> {
        let config = serde_json::to_string(&app.config)?;
        let ts = now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO applications(machine_id, package_id, name, args, pid, version, protocol, cpe, config, created_at, updated_at)
             VALUES (?,?,?,?,?,?,?,?,?,?,?)
             ON CONFLICT(machine_id, name, pid) DO UPDATE SET
               package_id=COALESCE(excluded.package_id, applications.package_id),
               args=CASE WHEN excluded.args<>'' THEN excluded.args ELSE applications.args END,
               version=CASE WHEN excluded.version<>'' THEN excluded.version ELSE applications.version END,
               protocol=CASE WHEN excluded.protocol<>'' THEN excluded.protocol ELSE applications.protocol END,
               cpe=CASE WHEN excluded.cpe<>'' THEN excluded.cpe ELSE applications.cpe END,
               updated_at=excluded.updated_at",
            params![
                app.machine_id, app.package_id, app.name, app.args, app.pid,
                app.version, app.protocol, app.cpe, config, ts, ts
            ],
        )?;
        let id: ApplicationId = conn.query_row(
            "SELECT id FROM applications WHERE machine_id=? AND name=? AND pid=?",
            params![app.machine_id, app.name, app.pid],
            |r| r.get(0),
        )?;
        app.id = id;
        Ok(id)
    }

    pub fn bulk_upsert_applications(&self, apps: &mut [Application]) -> Result<()> {
        for app in apps.iter_mut() {
            self.upsert_application(app)?;
        }
        Ok(())
    }

    pub fn applications_by_machine(&self, machine_id: MachineId) -> Result<Vec<Application>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {APP_COLS} FROM applications WHERE machine_id=? ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![machine_id], application_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn link_application_package(&self, app_id: ApplicationId, package_id: PackageId) -> Result<()> {
        self.conn().execute(
            "UPDATE applications SET package_id=?, updated_at=? WHERE id=?",
            params![package_id, now(), app_id],
        )?;
        Ok(())
    }

    /// Upsert keyed on (port, protocol, addr, nic). A NULL nic marks a remote
    /// endpoint and is matched with `IS NULL` since the engine treats NULLs
    /// as distinct in unique indexes.
    pub fn upsert_endpoint(&self, ep: &mut ApplicationEndpoint) -> Result<EndpointId> {
        let protocols = ep
            .application_protocols
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tls = ep.tls.as_ref().map(serde_json::to_string).transpose()?;
        let fingerprints = ep.fingerprints.as_ref().map(serde_json::to_string).transpose()?;
        let ts = now();
        let conn = self.conn();

        let existing: Option<EndpointId> = match ep.network_interface_id {
            Some(nic) => conn
                .query_row(
                    "SELECT id FROM application_endpoints
                     WHERE port=? AND protocol=? AND addr=? AND network_interface_id=?",
                    params![ep.port as i64, ep.protocol.as_str(), ep.addr, nic],
                    |r| r.get(0),
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT id FROM application_endpoints
                     WHERE port=? AND protocol=? AND addr=? AND network_interface_id IS NULL",
                    params![ep.port as i64, ep.protocol.as_str(), ep.addr],
                    |r| r.get(0),
                )
                .optional()?,
        };

        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE application_endpoints SET
                       application_id=COALESCE(?, application_id),
                       network_interface_id=COALESCE(?, network_interface_id),
                       application_protocols=COALESCE(?, application_protocols),
                       saas=COALESCE(?, saas),
                       tls=COALESCE(?, tls),
                       fingerprints=COALESCE(?, fingerprints),
                       updated_at=?
                     WHERE id=?",
                    params![ep.application_id, ep.network_interface_id, protocols, ep.saas, tls, fingerprints, ts, id],
                )?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO application_endpoints(application_id, network_interface_id, addr, port, protocol, application_protocols, saas, tls, fingerprints, created_at, updated_at)
                     VALUES (?,?,?,?,?,?,?,?,?,?,?)",
                    params![
                        ep.application_id, ep.network_interface_id, ep.addr, ep.port as i64,
                        ep.protocol.as_str(), protocols, ep.saas, tls, fingerprints, ts, ts
                    ],
                )?;
                conn.last_insert_rowid()
            }
        };
        ep.id = id;
        Ok(id)
    }

    pub fn bulk_upsert_endpoints(&self, eps: &mut [ApplicationEndpoint]) -> Result<()> {
        for ep in eps.iter_mut() {
            self.upsert_endpoint(ep)?;
        }
        Ok(())
    }

    pub fn get_endpoint(&self, id: EndpointId) -> Result<ApplicationEndpoint> {
        let conn = self.conn();
        Ok(conn.query_row(
            &format!("SELECT {EP_COLS} FROM application_endpoints WHERE id=?"),
            params![id],
            endpoint_from_row,
        )?)
    }

    /// TCP endpoints bound on one of `ports` (local and remote alike).
    pub fn endpoints_with_ports(&self, ports: &[u16]) -> Result<Vec<ApplicationEndpoint>> {
        if ports.is_empty() {
            return Ok(vec![]);
        }
        let list = ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EP_COLS} FROM application_endpoints
             WHERE protocol IN ('tcp','tcp6') AND port IN ({list}) ORDER BY id"
        ))?;
        let rows = stmt.query_map([], endpoint_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn endpoints_with_tls_without_fingerprints(&self) -> Result<Vec<ApplicationEndpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EP_COLS} FROM application_endpoints
             WHERE tls IS NOT NULL AND fingerprints IS NULL ORDER BY id"
        ))?;
        let rows = stmt.query_map([], endpoint_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn endpoints_with_tls(&self) -> Result<Vec<ApplicationEndpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EP_COLS} FROM application_endpoints WHERE tls IS NOT NULL ORDER BY id"
        ))?;
        let rows = stmt.query_map([], endpoint_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn endpoints_without_saas(&self, limit: usize) -> Result<Vec<ApplicationEndpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EP_COLS} FROM application_endpoints WHERE saas IS NULL ORDER BY id LIMIT ?"
        ))?;
        let rows = stmt.query_map(params![limit as i64], endpoint_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn endpoints_by_application(&self, app_id: ApplicationId) -> Result<Vec<ApplicationEndpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EP_COLS} FROM application_endpoints WHERE application_id=? ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![app_id], endpoint_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Application-less endpoints on NICs of `machine_id`.
    pub fn loose_endpoints_by_machine(&self, machine_id: MachineId) -> Result<Vec<ApplicationEndpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.application_id, e.network_interface_id, e.addr, e.port, e.protocol,
                    e.application_protocols, e.saas, e.tls, e.fingerprints
             FROM application_endpoints e
             JOIN network_interfaces ni ON ni.id = e.network_interface_id
             WHERE e.application_id IS NULL AND ni.machine_id=? ORDER BY e.id",
        )?;
        let rows = stmt.query_map(params![machine_id], endpoint_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_endpoint_tls(&self, id: EndpointId, tls: &TlsInfo) -> Result<()> {
        self.conn().execute(
            "UPDATE application_endpoints SET tls=?, updated_at=? WHERE id=?",
            params![serde_json::to_string(tls)?, now(), id],
        )?;
        Ok(())
    }

    pub fn set_endpoint_fingerprints(&self, id: EndpointId, fp: &Fingerprints) -> Result<()> {
        self.conn().execute(
            "UPDATE application_endpoints SET fingerprints=?, updated_at=? WHERE id=?",
            params![serde_json::to_string(fp)?, now(), id],
        )?;
        Ok(())
    }

    pub fn set_endpoint_saas(&self, id: EndpointId, saas: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE application_endpoints SET saas=?, updated_at=? WHERE id=?",
            params![saas, now(), id],
        )?;
        Ok(())
    }

    pub fn upsert_flow(&self, flow: &mut Flow) -> Result<i64> {
        let ts = now();
        let conn = self.conn();
        let existing: Option<i64> = match flow.src_application_id {
            Some(app) => conn
                .query_row(
                    "SELECT id FROM flows WHERE src_application_id=? AND src_addr=? AND dst_endpoint_id=?",
                    params![app, flow.src_addr, flow.dst_endpoint_id],
                    |r| r.get(0),
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT id FROM flows WHERE src_application_id IS NULL AND src_addr=? AND dst_endpoint_id=?",
                    params![flow.src_addr, flow.dst_endpoint_id],
                    |r| r.get(0),
                )
                .optional()?,
        };
        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE flows SET src_network_interface_id=COALESCE(?, src_network_interface_id), updated_at=? WHERE id=?",
                    params![flow.src_network_interface_id, ts, id],
                )?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO flows(src_application_id, src_network_interface_id, src_addr, dst_endpoint_id, state, created_at, updated_at)
                     VALUES (?,?,?,?,?,?,?)",
                    params![
                        flow.src_application_id,
                        flow.src_network_interface_id,
                        flow.src_addr,
                        flow.dst_endpoint_id,
                        flow.state,
                        ts,
                        ts
                    ],
                )?;
                conn.last_insert_rowid()
            }
        };
        flow.id = id;
        Ok(id)
    }

    pub fn bulk_upsert_flows(&self, flows: &mut [Flow]) -> Result<()> {
        for flow in flows.iter_mut() {
            self.upsert_flow(flow)?;
        }
        Ok(())
    }

    pub fn flows_by_dst_endpoint(&self, endpoint_id: EndpointId) -> Result<Vec<Flow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, src_application_id, src_network_interface_id, src_addr, dst_endpoint_id, state
             FROM flows WHERE dst_endpoint_id=? ORDER BY id",
        )?;
        let rows = stmt.query_map(params![endpoint_id], |r| {
            Ok(Flow {
                id: r.get(0)?,
                src_application_id: r.get(1)?,
                src_network_interface_id: r.get(2)?,
                src_addr: r.get(3)?,
                dst_endpoint_id: r.get(4)?,
                state: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn link_user_application(&self, user_id: UserId, app_id: ApplicationId) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_applications(user_id, application_id) VALUES (?,?)
             ON CONFLICT DO NOTHING",
            params![user_id, app_id],
        )?;
        Ok(())
    }

    pub fn upsert_policy(&self, policy: &EndpointPolicy) -> Result<()> {
        let ts = now();
        self.conn().execute(
            "INSERT INTO endpoint_policies(endpoint_id, action, src_endpoint_id, src_addr, priority, source, created_at, updated_at)
             VALUES (?,?,?,?,?,?,?,?)
             ON CONFLICT(endpoint_id, action, src_endpoint_id, src_addr) DO UPDATE SET
               priority=excluded.priority, source=excluded.source, updated_at=excluded.updated_at",
            params![
                policy.endpoint_id,
                policy.action.as_str(),
                policy.src_endpoint_id,
                policy.src_addr,
                policy.priority,
                policy.source,
                ts,
                ts
            ],
        )?;
        Ok(())
    }

    /// One-statement application-protocol tagging from well-known ports,
    /// touching only rows that have no tag yet.
    pub fn apply_standard_protocols(&self, tcp: &[(u16, &str)], udp: &[(u16, &str)]) -> Result<usize> {
        if tcp.is_empty() && udp.is_empty() {
            return Ok(0);
        }
        let case_arms = |map: &[(u16, &str)]| -> String {
            map.iter()
                .map(|(port, proto)| format!("WHEN {port} THEN '[\"{proto}\"]'"))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let tcp_arms = case_arms(tcp);
        let udp_arms = case_arms(udp);
        let sql = format!(
            "UPDATE application_endpoints SET application_protocols =
               CASE
                 WHEN protocol IN ('tcp','tcp6') THEN CASE port {tcp_arms} ELSE NULL END
                 WHEN protocol IN ('udp','udp6') THEN CASE port {udp_arms} ELSE NULL END
               END,
               updated_at = ?
             WHERE application_protocols IS NULL AND (
               (protocol IN ('tcp','tcp6') AND port IN ({tcp_ports})) OR
               (protocol IN ('udp','udp6') AND port IN ({udp_ports}))
             )",
            tcp_ports = ports_list(tcp),
            udp_ports = ports_list(udp),
        );
        let changed = self.conn().execute(&sql, params![now()])?;
        Ok(changed)
    }

    /// Machines reachable on an open TCP `port`, with the address it was
    /// seen on.
    pub fn machines_with_open_tcp_port(&self, port: u16) -> Result<Vec<(MachineId, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ni.machine_id, e.addr FROM application_endpoints e
             JOIN network_interfaces ni ON ni.id = e.network_interface_id
             WHERE e.port=? AND e.protocol IN ('tcp','tcp6') AND ni.machine_id IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![port as i64], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Ports of listening endpoints attached to `machine_id`, for the
    /// identity query.
    pub fn listening_ports_of_machine(&self, machine_id: MachineId) -> Result<Vec<u16>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT e.port FROM application_endpoints e
             JOIN network_interfaces ni ON ni.id = e.network_interface_id
             WHERE ni.machine_id=? ORDER BY e.port",
        )?;
        let rows = stmt.query_map(params![machine_id], |r| r.get::<_, i64>(0))?;
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|p| p as u16)
            .collect())
    }
}

fn ports_list(map: &[(u16, &str)]) -> String {
    if map.is_empty() {
        // empty IN () is a syntax error; a port of -1 never matches
        return String::from("-1");
    }
    map.iter().map(|(p, _)| p.to_string()).collect::<Vec<_>>().join(",")
}
