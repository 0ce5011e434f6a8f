use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};
use tracing::debug;

const BUS_SOCKET: &str = "/var/run/dbus/system_bus_socket";

/// Asks hostnamed for the Chassis property (laptop, desktop, vm, server...).
/// Linux only; not applicable when the system bus socket is missing.
pub struct ChassisModule;

#[async_trait]
impl Module for ChassisModule {
    fn name(&self) -> &'static str {
        "chassis"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["host-basic"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        if !cfg!(target_os = "linux") {
            return Err(ModuleError::not_applicable("chassis detection is Linux only"));
        }
        if !std::path::Path::new(BUS_SOCKET).exists() {
            return Err(ModuleError::not_applicable("system bus socket not present"));
        }
        let output = tokio::process::Command::new("busctl")
            .args([
                "get-property",
                "org.freedesktop.hostname1",
                "/org/freedesktop/hostname1",
                "org.freedesktop.hostname1",
                "Chassis",
            ])
            .output()
            .await
            .map_err(anyhow::Error::from)?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "busctl failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )
            .into());
        }
        let chassis = parse_busctl_string(&String::from_utf8_lossy(&output.stdout));
        if chassis.is_empty() {
            return Ok(());
        }
        debug!(chassis = %chassis, "chassis detected");
        let host = ctx.store.get_or_create_host()?;
        ctx.store.set_chassis(host.id, &chassis)?;
        Ok(())
    }
}

/// busctl renders string properties as `s "value"`.
fn parse_busctl_string(raw: &str) -> String {
    raw.trim()
        .strip_prefix('s')
        .unwrap_or(raw)
        .trim()
        .trim_matches('"')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busctl_string_property_is_unquoted() {
        assert_eq!(parse_busctl_string("s \"laptop\"\n"), "laptop");
        assert_eq!(parse_busctl_string("s \"vm\""), "vm");
        assert_eq!(parse_busctl_string(""), "");
    }
}
