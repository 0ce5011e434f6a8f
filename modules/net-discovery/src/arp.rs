use std::net::Ipv4Addr;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use situation_core::{join_errors, Module, ModuleError, ScanContext};
use situation_store::{normalize_mac, NetworkInterface, NicFlags, SubnetId};
use tracing::{debug, info};

/// Harvests the kernel neighbour table. No requests are sent; the ping sweep
/// right before is what warms the table up.
pub struct ArpModule;

#[async_trait]
impl Module for ArpModule {
    fn name(&self) -> &'static str {
        "arp"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["ping"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let Ok(text) = std::fs::read_to_string("/proc/net/arp") else {
            return Err(ModuleError::not_applicable("no /proc/net/arp on this platform"));
        };
        let entries = parse_arp_table(&text);
        info!(count = entries.len(), "neighbour table read");

        let mut errors = Vec::new();
        for subnet in ctx.store.all_ipv4_networks()? {
            let Ok(net) = subnet.cidr.parse::<Ipv4Net>() else { continue };
            for entry in entries.iter().filter(|e| net.contains(&e.ip)) {
                if let Err(e) = absorb(ctx, entry, subnet.id) {
                    errors.push(e);
                }
            }
        }
        match join_errors(errors) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Records one neighbour entry, merging with what the store already holds.
/// A MAC or IP disagreement is an error for that entry only.
fn absorb(ctx: &ScanContext, entry: &ArpEntry, subnet_id: SubnetId) -> Result<()> {
    let ip = entry.ip.to_string();

    if let Some(nic) = ctx.store.nic_by_ip(&ip)? {
        if nic.mac.is_empty() {
            ctx.store.set_nic_mac(nic.id, &entry.mac)?;
            debug!(ip = %ip, mac = %entry.mac, "MAC learned for known IP");
        } else if nic.mac != entry.mac {
            bail!("MAC conflict on {ip}: store has {}, ARP says {}", nic.mac, entry.mac);
        }
        ctx.store.link_nic_subnet(nic.id, subnet_id)?;
        return Ok(());
    }

    if let Some(nic) = ctx.store.nic_by_mac(&entry.mac)? {
        if nic.ips.is_empty() {
            ctx.store.set_nic_ips(nic.id, &[ip.clone()])?;
            debug!(ip = %ip, mac = %entry.mac, "IP learned for known MAC");
        } else {
            bail!(
                "IP conflict on {}: store has {:?}, ARP says {ip}",
                entry.mac,
                nic.ips
            );
        }
        ctx.store.link_nic_subnet(nic.id, subnet_id)?;
        return Ok(());
    }

    let machine = ctx.store.new_empty_machine()?;
    let mut nic = NetworkInterface {
        machine_id: Some(machine),
        mac: entry.mac.clone(),
        ips: vec![ip],
        flags: NicFlags {
            up: true,
            ..NicFlags::default()
        },
        ..NetworkInterface::default()
    };
    ctx.store.upsert_nic(&mut nic)?;
    ctx.store.link_nic_subnet(nic.id, subnet_id)?;
    debug!(mac = %entry.mac, "new machine from ARP entry");
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: String,
}

const ATF_COM: u64 = 0x2;

fn parse_arp_table(text: &str) -> Vec<ArpEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            let flags = u64::from_str_radix(fields[2].trim_start_matches("0x"), 16).ok()?;
            if flags & ATF_COM == 0 {
                return None;
            }
            let mac = normalize_mac(fields[3]);
            if mac.is_empty() || mac == "00:00:00:00:00:00" {
                return None;
            }
            Some(ArpEntry {
                ip: fields[0].parse().ok()?,
                mac,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use situation_core::Config;
    use situation_store::Store;
    use uuid::Uuid;

    use super::*;

    const TABLE: &str = "IP address       HW type     Flags       HW address            Mask     Device\n\
        10.0.2.2         0x1         0x2         52:55:0a:00:02:02     *        eth0\n\
        10.0.2.3         0x1         0x0         00:00:00:00:00:00     *        eth0\n\
        10.0.2.4         0x1         0x2         00:00:00:00:00:00     *        eth0\n";

    #[test]
    fn incomplete_and_zero_mac_entries_are_dropped() {
        let entries = parse_arp_table(TABLE);
        assert_eq!(
            entries,
            vec![ArpEntry {
                ip: "10.0.2.2".parse().unwrap(),
                mac: "52:55:0A:00:02:02".into(),
            }]
        );
    }

    fn ctx() -> ScanContext {
        let agent = Uuid::new_v4();
        ScanContext {
            agent,
            store: Arc::new(Store::open_in_memory(agent).unwrap()),
            config: Arc::new(Config::default()),
        }
    }

    #[test]
    fn orphan_nic_from_ping_gains_the_mac() {
        let ctx = ctx();
        let net: ipnet::IpNet = "10.0.2.0/24".parse().unwrap();
        let subnet = ctx.store.get_or_create_subnetwork(&net, "", None).unwrap();
        let mut orphan = NetworkInterface {
            ips: vec!["10.0.2.2".into()],
            ..NetworkInterface::default()
        };
        ctx.store.upsert_nic(&mut orphan).unwrap();

        let entry = ArpEntry {
            ip: "10.0.2.2".parse().unwrap(),
            mac: "52:55:0A:00:02:02".into(),
        };
        absorb(&ctx, &entry, subnet).unwrap();
        let nic = ctx.store.get_nic(orphan.id).unwrap();
        assert_eq!(nic.mac, "52:55:0A:00:02:02");
    }

    #[test]
    fn mac_disagreement_is_an_error_for_that_entry() {
        let ctx = ctx();
        let net: ipnet::IpNet = "10.0.2.0/24".parse().unwrap();
        let subnet = ctx.store.get_or_create_subnetwork(&net, "", None).unwrap();
        let machine = ctx.store.new_empty_machine().unwrap();
        let mut nic = NetworkInterface {
            machine_id: Some(machine),
            mac: "AA:BB:CC:DD:EE:FF".into(),
            ips: vec!["10.0.2.2".into()],
            ..NetworkInterface::default()
        };
        ctx.store.upsert_nic(&mut nic).unwrap();

        let entry = ArpEntry {
            ip: "10.0.2.2".parse().unwrap(),
            mac: "52:55:0A:00:02:02".into(),
        };
        assert!(absorb(&ctx, &entry, subnet).is_err());
    }

    #[test]
    fn unknown_pairs_create_a_machine_with_one_nic() {
        let ctx = ctx();
        let net: ipnet::IpNet = "10.0.2.0/24".parse().unwrap();
        let subnet = ctx.store.get_or_create_subnetwork(&net, "", None).unwrap();
        let entry = ArpEntry {
            ip: "10.0.2.7".parse().unwrap(),
            mac: "52:55:0A:00:02:07".into(),
        };
        absorb(&ctx, &entry, subnet).unwrap();
        let nic = ctx.store.nic_by_mac("52:55:0A:00:02:07").unwrap().unwrap();
        assert!(nic.machine_id.is_some());
        assert_eq!(nic.ips, vec!["10.0.2.7".to_string()]);
    }
}
