use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};
use tracing::debug;

use crate::oui;

/// Resolves NIC vendors from the embedded OUI registry. Only rows with a MAC
/// and no vendor yet are touched, so a re-scan is cheap.
pub struct MacVendorModule;

#[async_trait]
impl Module for MacVendorModule {
    fn name(&self) -> &'static str {
        "macvendor"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["arp"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let mut resolved = 0usize;
        for (id, mac) in ctx.store.nics_missing_vendor()? {
            let Some(vendor) = oui::lookup(&mac) else { continue };
            ctx.store.set_mac_vendor(id, vendor)?;
            resolved += 1;
        }
        debug!(resolved, "MAC vendors resolved");
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
    async fn only_unresolved_rows_are_updated() {
        let agent = Uuid::new_v4();
        let store = Arc::new(Store::open_in_memory(agent).unwrap());
        let machine = store.new_empty_machine().unwrap();
        let mut known = NetworkInterface {
            machine_id: Some(machine),
            name: "eth0".into(),
            mac: "52:54:00:12:34:56".into(),
            ..NetworkInterface::default()
        };
        store.upsert_nic(&mut known).unwrap();
        let mut exotic = NetworkInterface {
            machine_id: Some(machine),
            name: "eth1".into(),
            mac: "FF:FF:FF:00:00:01".into(),
            ..NetworkInterface::default()
        };
        store.upsert_nic(&mut exotic).unwrap();

        let ctx = ScanContext {
            agent,
            store: store.clone(),
            config: Arc::new(Config::default()),
        };
        MacVendorModule.run(&ctx).await.unwrap();

        assert_eq!(
            store.get_nic(known.id).unwrap().mac_vendor.as_deref(),
            Some("QEMU/KVM")
        );
        assert_eq!(store.get_nic(exotic.id).unwrap().mac_vendor, None);
    }
}
