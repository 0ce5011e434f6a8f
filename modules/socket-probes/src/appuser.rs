use std::collections::HashMap;

use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};
use tracing::{debug, info};

use crate::procnet;

/// Links applications to the local accounts running them, using the real UID
/// from `/proc/<pid>/status`.
pub struct AppUserModule;

#[async_trait]
impl Module for AppUserModule {
    fn name(&self) -> &'static str {
        "appuser"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["dpkg", "rpm", "zypper", "msi"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let host = ctx.store.get_or_create_host()?;
        let users: HashMap<String, i64> = ctx
            .store
            .users_by_machine(host.id)?
            .into_iter()
            .map(|u| (u.uid, u.id))
            .collect();

        let mut linked = 0usize;
        for app in ctx.store.applications_by_machine(host.id)? {
            if app.pid <= 0 {
                continue;
            }
            let Some(uid) = procnet::process_uid(app.pid) else {
                // the process exited since netstat ran
                debug!(pid = app.pid, name = %app.name, "process gone");
                continue;
            };
            if let Some(user) = users.get(&uid) {
                ctx.store.link_user_application(*user, app.id)?;
                linked += 1;
            }
        }
        info!(linked, "applications linked to users");
        Ok(())
    }
}
