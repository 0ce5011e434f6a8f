use std::sync::Arc;

use async_trait::async_trait;
use situation_store::Store;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ModuleError;

/// Shared state handed to every module of a scan.
pub struct ScanContext {
    pub agent: Uuid,
    pub store: Arc<Store>,
    pub config: Arc<Config>,
}

/// A self-contained probe. Modules run exactly once per scan, after the
/// modules they name in `dependencies`, and must be idempotent with respect
/// to the store: re-running converges, never duplicates.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Declares typed options (defaults and usage) on the config binder.
    fn bind(&self, _config: &mut Config) {}

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError>;
}
