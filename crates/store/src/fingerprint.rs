//! "Is this host already known?" matcher.
//!
//! Multi-agent deployments share one store; before neighbour discovery can
//! duplicate this host, the matcher looks for a machine that already
//! represents it, first by definitive identifiers (agent UUID, OS host id),
//! then by a fuzzy score computed in a single SQL statement.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::models::{normalize_mac, MachineId};
use crate::open::{now, Store};

/// Identity facts gathered from the local host.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub agent: Uuid,
    pub host_id: String,
    pub hostname: String,
    pub macs: Vec<String>,
    pub ips: Vec<String>,
    pub ports: Vec<u16>,
}

/// Ports cap their contribution so common server software running on many
/// hosts cannot alone trigger a claim.
const SCORE_THRESHOLD: f64 = 0.3;

impl Store {
    /// Finds the machine matching `identity`, if any, with its score
    /// (1.0 for definitive matches). `exclude` names the caller's own row so
    /// a host created earlier in the same scan never matches itself.
    pub fn find_machine(
        &self,
        identity: &Identity,
        exclude: Option<MachineId>,
    ) -> Result<Option<(MachineId, f64)>> {
        let conn = self.conn();
        let excluded = exclude.unwrap_or(-1);

        let by_agent: Option<MachineId> = conn
            .query_row(
                "SELECT id FROM machines WHERE agent=? AND id<>?",
                params![identity.agent.to_string(), excluded],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = by_agent {
            return Ok(Some((id, 1.0)));
        }

        if !identity.host_id.is_empty() {
            let by_host_id: Option<MachineId> = conn
                .query_row(
                    "SELECT id FROM machines WHERE host_id=? AND id<>?",
                    params![identity.host_id, excluded],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = by_host_id {
                return Ok(Some((id, 1.0)));
            }
        }

        let macs = serde_json::to_string(
            &identity.macs.iter().map(|m| normalize_mac(m)).collect::<Vec<_>>(),
        )?;
        let ips = serde_json::to_string(&identity.ips)?;
        let ports = serde_json::to_string(&identity.ports)?;
        let ip_overlap = self.dialect().array_overlaps("ni.ip", "?2");

        let sql = format!(
            "SELECT m.id,
                    0.4 * COALESCE(macs.n, 0)
                  + 0.2 * COALESCE(ips.n, 0)
                  + MIN(0.1 * COALESCE(ports.n, 0), 0.3)
                  + 0.2 * (m.hostname <> '' AND LOWER(m.hostname) = LOWER(?1)) AS score
             FROM machines m
             LEFT JOIN (
               SELECT ni.machine_id, COUNT(*) AS n FROM network_interfaces ni
               WHERE ni.mac <> '' AND ni.mac IN (SELECT value FROM json_each(?3))
               GROUP BY ni.machine_id
             ) macs ON macs.machine_id = m.id
             LEFT JOIN (
               SELECT ni.machine_id, COUNT(*) AS n FROM network_interfaces ni
               WHERE {ip_overlap}
               GROUP BY ni.machine_id
             ) ips ON ips.machine_id = m.id
             LEFT JOIN (
               SELECT ni.machine_id, COUNT(*) AS n
               FROM application_endpoints e
               JOIN network_interfaces ni ON ni.id = e.network_interface_id
               WHERE e.port IN (SELECT value FROM json_each(?4))
               GROUP BY ni.machine_id
             ) ports ON ports.machine_id = m.id
             WHERE m.id <> ?5
             ORDER BY score DESC, m.id ASC
             LIMIT 1"
        );

        let best: Option<(MachineId, f64)> = conn
            .query_row(
                &sql,
                params![identity.hostname, ips, macs, ports, excluded],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(best.filter(|(_, score)| *score >= SCORE_THRESHOLD))
    }

    /// Writes this agent's UUID into `machine_id` and refreshes the host-id
    /// cache. Any previous row claimed by this agent is released first to
    /// keep the agent column unique.
    pub fn claim_machine(&self, machine_id: MachineId) -> Result<()> {
        let agent = self.agent().to_string();
        let ts = now();
        {
            let conn = self.conn();
            conn.execute(
                "UPDATE machines SET agent=NULL, updated_at=? WHERE agent=? AND id<>?",
                params![ts, agent, machine_id],
            )?;
            conn.execute(
                "UPDATE machines SET agent=?, updated_at=? WHERE id=?",
                params![agent, ts, machine_id],
            )?;
        }
        self.cache_host_id(machine_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;

    fn seeded_neighbour(store: &Store, hostname: &str, mac: &str, ip: &str) -> MachineId {
        let id = store.new_empty_machine().unwrap();
        if !hostname.is_empty() {
            store.set_hostname(id, hostname).unwrap();
        }
        let mut nic = NetworkInterface {
            machine_id: Some(id),
            name: "eth0".into(),
            mac: mac.into(),
            ips: vec![ip.into()],
            ..Default::default()
        };
        store.upsert_nic(&mut nic).unwrap();
        id
    }

    #[test]
    fn mac_match_alone_is_enough() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        let seeded = seeded_neighbour(&store, "", "52:54:00:12:34:56", "10.0.2.15");
        let identity = Identity {
            agent: store.agent(),
            macs: vec!["52:54:00:12:34:56".into()],
            ..Default::default()
        };
        let (id, score) = store.find_machine(&identity, None).unwrap().unwrap();
        assert_eq!(id, seeded);
        assert!((score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn port_contribution_is_capped() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        let seeded = seeded_neighbour(&store, "", "52:54:00:aa:bb:cc", "10.0.2.40");
        let nic = store.nics_by_machine(seeded).unwrap().remove(0);
        for port in [22u16, 80, 443, 8080, 9090] {
            let mut ep = ApplicationEndpoint {
                id: 0,
                application_id: None,
                network_interface_id: Some(nic.id),
                addr: "10.0.2.40".into(),
                port,
                protocol: Protocol::Tcp,
                application_protocols: None,
                saas: None,
                tls: None,
                fingerprints: None,
            };
            store.upsert_endpoint(&mut ep).unwrap();
        }
        // five shared ports would score 0.5 without the cap
        let identity = Identity {
            agent: store.agent(),
            ports: vec![22, 80, 443, 8080, 9090],
            ..Default::default()
        };
        let found = store.find_machine(&identity, None).unwrap();
        assert_eq!(found.map(|(_, s)| (s * 10.0).round() / 10.0), Some(0.3));
    }

    #[test]
    fn hostname_and_ip_combine() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        let seeded = seeded_neighbour(&store, "box", "", "10.0.2.15");
        let identity = Identity {
            agent: store.agent(),
            hostname: "box".into(),
            ips: vec!["10.0.2.15".into()],
            ..Default::default()
        };
        let (id, score) = store.find_machine(&identity, None).unwrap().unwrap();
        assert_eq!(id, seeded);
        assert!((score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn below_threshold_matches_nothing() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        seeded_neighbour(&store, "other", "52:54:00:12:34:56", "10.0.2.15");
        let identity = Identity {
            agent: store.agent(),
            ips: vec!["10.0.2.15".into()],
            ..Default::default()
        };
        // a single IP match scores 0.2
        assert!(store.find_machine(&identity, None).unwrap().is_none());
    }

    #[test]
    fn an_empty_store_matches_nothing_without_error() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        let identity = Identity {
            agent: store.agent(),
            host_id: "f3a1d9c2-7f30-4a89-9e0a-6d2f3a6a9b10".into(),
            hostname: "box".into(),
            macs: vec!["52:54:00:12:34:56".into()],
            ips: vec!["10.0.2.15".into()],
            ports: vec![22],
        };
        // all three lookup stages find no row; none of them is an error
        assert!(store.find_machine(&identity, None).unwrap().is_none());
    }

    #[test]
    fn host_id_match_is_definitive() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        let seeded = seeded_neighbour(&store, "", "", "172.16.0.4");
        let mut machine = store.get_machine(seeded).unwrap();
        machine.host_id = "f3a1d9c2-7f30-4a89-9e0a-6d2f3a6a9b10".into();
        store.update_machine(&machine).unwrap();

        let identity = Identity {
            agent: store.agent(),
            host_id: machine.host_id.clone(),
            ..Default::default()
        };
        let (id, score) = store.find_machine(&identity, None).unwrap().unwrap();
        assert_eq!(id, seeded);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn claim_moves_the_agent_between_rows() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        let fresh = store.get_or_create_host().unwrap();
        let seeded = seeded_neighbour(&store, "known", "52:54:00:12:34:56", "10.0.2.15");

        store.claim_machine(seeded).unwrap();
        let claimed = store.get_machine(seeded).unwrap();
        assert_eq!(claimed.agent, Some(store.agent()));
        assert_eq!(store.get_machine(fresh.id).unwrap().agent, None);
        // host cache now resolves to the claimed machine
        assert_eq!(store.get_or_create_host().unwrap().id, seeded);
    }
}
