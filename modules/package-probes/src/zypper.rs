use std::path::Path;

use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};

use crate::manager::{absorb_packages, supported_host};
use crate::rpm::read_database;

const FAMILIES: &[&str] = &["suse"];
const DB_PATH: &str = "/var/lib/rpm/Packages.db";

/// Reads installed packages on suse systems, where the rpm database lives
/// at `/var/lib/rpm/Packages.db` but follows the same layout.
pub struct ZypperModule;

#[async_trait]
impl Module for ZypperModule {
    fn name(&self) -> &'static str {
        "zypper"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["standard-protocol"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        if !cfg!(target_os = "linux") {
            return Err(ModuleError::not_applicable("zypper exists on linux only"));
        }
        let host = supported_host(ctx, FAMILIES)?;
        let path = Path::new(DB_PATH);
        if !path.is_file() {
            return Err(ModuleError::not_applicable("no zypper database"));
        }
        let packages = read_database(path)?;
        absorb_packages(ctx, host.id, "zypper", packages)
    }
}
