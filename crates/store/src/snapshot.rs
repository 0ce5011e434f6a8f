use anyhow::Result;
use rusqlite::params;

use crate::models::*;
use crate::open::Store;

impl Store {
    fn cpu_of_machine(&self, machine_id: MachineId) -> Result<Option<Cpu>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, machine_id, model, vendor, cores FROM cpus WHERE machine_id=?",
        )?;
        let mut rows = stmt.query_map(params![machine_id], |r| {
            Ok(Cpu {
                id: r.get(0)?,
                machine_id: r.get(1)?,
                model: r.get(2)?,
                vendor: r.get(3)?,
                cores: r.get(4)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    fn gpus_of_machine(&self, machine_id: MachineId) -> Result<Vec<Gpu>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, machine_id, idx, product, vendor, driver FROM gpus
             WHERE machine_id=? ORDER BY idx",
        )?;
        let rows = stmt.query_map(params![machine_id], |r| {
            Ok(Gpu {
                id: r.get(0)?,
                machine_id: r.get(1)?,
                index: r.get(2)?,
                product: r.get(3)?,
                vendor: r.get(4)?,
                driver: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn disks_of_machine(&self, machine_id: MachineId) -> Result<Vec<Disk>> {
        let disks: Vec<(i64, String, i64, String, String)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, name, size, disk_type, controller FROM disks
                 WHERE machine_id=? ORDER BY name",
            )?;
            let rows = stmt.query_map(params![machine_id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut out = Vec::with_capacity(disks.len());
        for (id, name, size, disk_type, controller) in disks {
            let partitions = {
                let conn = self.conn();
                let mut stmt = conn.prepare(
                    "SELECT name, size, part_type, read_only FROM partitions
                     WHERE disk_id=? ORDER BY name",
                )?;
                let rows = stmt.query_map(params![id], |r| {
                    Ok(Partition {
                        name: r.get(0)?,
                        size: r.get(1)?,
                        part_type: r.get(2)?,
                        read_only: r.get::<_, i64>(3)? != 0,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            out.push(Disk {
                id,
                machine_id,
                name,
                size,
                disk_type: parse_disk_type(&disk_type),
                controller: parse_controller(&controller),
                partitions,
            });
        }
        Ok(out)
    }

    /// Assembles the machine subtree emitted after each scan.
    pub fn snapshot_machines(&self) -> Result<Vec<PayloadMachine>> {
        let mut out = Vec::new();
        for machine in self.all_machines()? {
            let machine_id = machine.id;
            let nics = self.nics_by_machine(machine_id)?;
            let mut subnetworks = Vec::new();
            for nic in &nics {
                for subnet in self.subnets_of_nic(nic.id)? {
                    if !subnetworks.iter().any(|s: &Subnetwork| s.id == subnet.id) {
                        subnetworks.push(subnet);
                    }
                }
            }
            let mut applications = Vec::new();
            for app in self.applications_by_machine(machine_id)? {
                let mut endpoints = Vec::new();
                for ep in self.endpoints_by_application(app.id)? {
                    let flows = self.flows_by_dst_endpoint(ep.id)?;
                    endpoints.push(PayloadEndpoint { endpoint: ep, flows });
                }
                applications.push(PayloadApplication {
                    application: app,
                    endpoints,
                });
            }
            let mut endpoints = Vec::new();
            for ep in self.loose_endpoints_by_machine(machine_id)? {
                let flows = self.flows_by_dst_endpoint(ep.id)?;
                endpoints.push(PayloadEndpoint { endpoint: ep, flows });
            }
            out.push(PayloadMachine {
                cpu: self.cpu_of_machine(machine_id)?,
                gpus: self.gpus_of_machine(machine_id)?,
                disks: self.disks_of_machine(machine_id)?,
                network_interfaces: nics,
                subnetworks,
                packages: self.packages_by_machine(machine_id)?,
                applications,
                endpoints,
                users: self.users_by_machine(machine_id)?,
                machine,
            });
        }
        Ok(out)
    }
}

fn parse_disk_type(s: &str) -> DiskType {
    match s {
        "hdd" => DiskType::Hdd,
        "ssd" => DiskType::Ssd,
        "floppy" => DiskType::Floppy,
        "optical" => DiskType::Optical,
        "vmdk" => DiskType::Vmdk,
        "raw" => DiskType::Raw,
        "sparse" => DiskType::Sparse,
        "flat" => DiskType::Flat,
        "se_sparse" => DiskType::SeSparse,
        "pmem" => DiskType::Pmem,
        "partitioned_raw" => DiskType::PartitionedRaw,
        "sparse_v1" => DiskType::SparseV1,
        _ => DiskType::Unknown,
    }
}

fn parse_controller(s: &str) -> DiskController {
    match s {
        "ide" => DiskController::Ide,
        "mmc" => DiskController::Mmc,
        "nvme" => DiskController::Nvme,
        "scsi" => DiskController::Scsi,
        "virtio" => DiskController::Virtio,
        _ => DiskController::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn snapshot_embeds_the_full_subtree() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        let host = store.get_or_create_host().unwrap();
        store.upsert_cpu(host.id, "Xeon", "Intel", 8).unwrap();

        let mut nic = NetworkInterface {
            machine_id: Some(host.id),
            name: "eth0".into(),
            mac: "52:54:00:12:34:56".into(),
            ips: vec!["10.0.2.15/24".into()],
            ..Default::default()
        };
        store.upsert_nic(&mut nic).unwrap();
        let net: ipnet::IpNet = "10.0.2.15/24".parse().unwrap();
        let subnet = store.get_or_create_subnetwork(&net, "10.0.2.1", None).unwrap();
        store.link_nic_subnet(nic.id, subnet).unwrap();

        let mut app = Application {
            machine_id: host.id,
            name: "/usr/sbin/sshd".into(),
            pid: 712,
            ..Default::default()
        };
        store.upsert_application(&mut app).unwrap();
        let mut ep = ApplicationEndpoint {
            id: 0,
            application_id: Some(app.id),
            network_interface_id: Some(nic.id),
            addr: "10.0.2.15".into(),
            port: 22,
            protocol: Protocol::Tcp,
            application_protocols: None,
            saas: None,
            tls: None,
            fingerprints: None,
        };
        store.upsert_endpoint(&mut ep).unwrap();
        let mut flow = Flow {
            src_addr: "10.0.0.9".into(),
            dst_endpoint_id: ep.id,
            ..Default::default()
        };
        store.upsert_flow(&mut flow).unwrap();

        let machines = store.snapshot_machines().unwrap();
        assert_eq!(machines.len(), 1);
        let m = &machines[0];
        assert_eq!(m.cpu.as_ref().map(|c| c.cores), Some(8));
        assert_eq!(m.network_interfaces.len(), 1);
        assert_eq!(m.subnetworks[0].cidr, "10.0.2.0/24");
        assert_eq!(m.applications.len(), 1);
        assert_eq!(m.applications[0].endpoints.len(), 1);
        assert_eq!(m.applications[0].endpoints[0].flows.len(), 1);
        assert_eq!(m.applications[0].endpoints[0].flows[0].src_addr, "10.0.0.9");
    }

    #[test]
    fn rescan_keeps_row_counts_stable() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        for _ in 0..2 {
            let host = store.get_or_create_host().unwrap();
            let mut nic = NetworkInterface {
                machine_id: Some(host.id),
                name: "eth0".into(),
                mac: "52:54:00:12:34:56".into(),
                ips: vec!["10.0.2.15/24".into()],
                ..Default::default()
            };
            store.upsert_nic(&mut nic).unwrap();
            let mut app = Application {
                machine_id: host.id,
                name: "/usr/sbin/sshd".into(),
                pid: 712,
                ..Default::default()
            };
            store.upsert_application(&mut app).unwrap();
            let mut ep = ApplicationEndpoint {
                id: 0,
                application_id: Some(app.id),
                network_interface_id: Some(nic.id),
                addr: "10.0.2.15".into(),
                port: 22,
                protocol: Protocol::Tcp,
                application_protocols: None,
                saas: None,
                tls: None,
                fingerprints: None,
            };
            store.upsert_endpoint(&mut ep).unwrap();
        }
        let machines = store.snapshot_machines().unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].network_interfaces.len(), 1);
        assert_eq!(machines[0].applications.len(), 1);
    }
}
