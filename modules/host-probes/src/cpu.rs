use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};

pub struct HostCpuModule;

#[async_trait]
impl Module for HostCpuModule {
    fn name(&self) -> &'static str {
        "host-cpu"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["host-basic"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let Ok(text) = std::fs::read_to_string("/proc/cpuinfo") else {
            return Err(ModuleError::not_applicable("no /proc/cpuinfo on this platform"));
        };
        let info = CpuInfo::parse(&text);
        let host = ctx.store.get_or_create_host()?;
        ctx.store
            .upsert_cpu(host.id, &info.model, &info.vendor, info.cores)?;
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CpuInfo {
    model: String,
    vendor: String,
    cores: i64,
}

impl CpuInfo {
    fn parse(text: &str) -> CpuInfo {
        let mut info = CpuInfo::default();
        let mut entries: i64 = 0;
        let mut max_core_id: Option<i64> = None;
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else { continue };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "processor" => entries += 1,
                "model name" if info.model.is_empty() => info.model = value.to_string(),
                "vendor_id" if info.vendor.is_empty() => info.vendor = value.to_string(),
                "core id" => {
                    if let Ok(id) = value.parse::<i64>() {
                        max_core_id = Some(max_core_id.map_or(id, |m: i64| m.max(id)));
                    }
                }
                _ => {}
            }
        }
        // highest core id + 1 when the kernel exposes per-thread core ids,
        // else the number of processor entries
        info.cores = match max_core_id {
            Some(m) => m + 1,
            None => entries,
        };
        info
    }
}
