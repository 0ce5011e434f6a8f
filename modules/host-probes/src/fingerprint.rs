use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};
use situation_store::{strip_prefix_len, Identity};
use tracing::info;

/// Reconciles this host with machines already present in the store.
///
/// A neighbour scan may have recorded this host before its agent first ran;
/// matching here prevents a duplicate row and attaches the agent UUID to the
/// richest existing record.
pub struct FingerprintModule;

#[async_trait]
impl Module for FingerprintModule {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["host-basic", "host-network"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let host = ctx.store.get_or_create_host()?;
        let nics = ctx.store.nics_by_machine(host.id)?;

        let identity = Identity {
            agent: ctx.agent,
            host_id: host.host_id.clone(),
            hostname: host.hostname.clone(),
            macs: nics.iter().filter(|n| !n.mac.is_empty()).map(|n| n.mac.clone()).collect(),
            ips: nics
                .iter()
                .flat_map(|n| n.ips.iter())
                .map(|ip| strip_prefix_len(ip))
                .collect(),
            ports: ctx.store.listening_ports_of_machine(host.id)?,
        };

        let Some((matched, score)) = ctx.store.find_machine(&identity, Some(host.id))? else {
            return Ok(());
        };
        info!(matched, score, "existing machine matches this host, claiming it");
        ctx.store.claim_machine(matched)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use situation_core::Config;
    use situation_store::{NetworkInterface, Store};
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn a_previously_scanned_neighbour_row_is_claimed() {
        let agent = Uuid::new_v4();
        let store = Arc::new(Store::open_in_memory(agent).unwrap());

        // the neighbour row a remote agent recorded for us earlier
        let neighbour = store.new_empty_machine().unwrap();
        let mut nic = NetworkInterface {
            machine_id: Some(neighbour),
            name: "eth0".into(),
            mac: "52:54:00:12:34:56".into(),
            ips: vec!["10.0.2.15/24".into()],
            ..Default::default()
        };
        store.upsert_nic(&mut nic).unwrap();

        // our own freshly created row with the same MAC
        let host = store.get_or_create_host().unwrap();
        let mut own = NetworkInterface {
            machine_id: Some(host.id),
            name: "eth0".into(),
            mac: "52:54:00:12:34:56".into(),
            ips: vec!["10.0.2.15/24".into()],
            ..Default::default()
        };
        store.upsert_nic(&mut own).unwrap();

        let ctx = ScanContext {
            agent,
            store: store.clone(),
            config: Arc::new(Config::default()),
        };
        FingerprintModule.run(&ctx).await.unwrap();

        // the richer neighbour row now carries our agent; ours was released
        assert_eq!(store.get_machine(neighbour).unwrap().agent, Some(agent));
        assert_eq!(store.get_machine(host.id).unwrap().agent, None);
        // later host lookups resolve to the claimed row
        assert_eq!(store.get_or_create_host().unwrap().id, neighbour);
    }
}
