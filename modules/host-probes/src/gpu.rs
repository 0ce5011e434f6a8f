use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};
use situation_store::Gpu;
use tracing::debug;

/// One row per graphics card, from the DRM class tree.
pub struct HostGpuModule;

#[async_trait]
impl Module for HostGpuModule {
    fn name(&self) -> &'static str {
        "host-gpu"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["host-basic"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let Ok(entries) = std::fs::read_dir("/sys/class/drm") else {
            return Err(ModuleError::not_applicable("no /sys/class/drm on this platform"));
        };
        let host = ctx.store.get_or_create_host()?;
        let mut found = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            // card0, card1, ... but not card0-HDMI-A-1 connector nodes
            let Some(index) = card_index(&name) else { continue };
            let device = entry.path().join("device");

            let vendor_id = read_trim(device.join("vendor"));
            let product_id = read_trim(device.join("device"));
            let driver = std::fs::read_link(device.join("driver"))
                .ok()
                .and_then(|p| p.file_name().map(|f| f.to_string_lossy().to_string()))
                .unwrap_or_default();

            let gpu = Gpu {
                id: 0,
                machine_id: host.id,
                index,
                product: product_id.unwrap_or_default(),
                vendor: vendor_name(vendor_id.as_deref()),
                driver,
            };
            ctx.store.upsert_gpu(&gpu)?;
            found += 1;
        }
        debug!(count = found, "graphics cards found");
        Ok(())
    }
}

fn read_trim(path: std::path::PathBuf) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn card_index(name: &str) -> Option<i64> {
    name.strip_prefix("card")?.parse().ok()
}

fn vendor_name(id: Option<&str>) -> String {
    match id {
        Some("0x10de") => "NVIDIA".to_string(),
        Some("0x1002") => "AMD".to_string(),
        Some("0x8086") => "Intel".to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
