use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};
use tracing::debug;

/// Upserts local accounts keyed on (machine, uid).
pub struct LocalUsersModule;

#[async_trait]
impl Module for LocalUsersModule {
    fn name(&self) -> &'static str {
        "local-users"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["host-basic"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let Ok(text) = std::fs::read_to_string("/etc/passwd") else {
            return Err(ModuleError::not_applicable("no /etc/passwd on this platform"));
        };
        let host = ctx.store.get_or_create_host()?;
        let accounts = parse_passwd(&text);
        for (uid, name) in &accounts {
            ctx.store.upsert_user(host.id, uid, name)?;
        }
        debug!(count = accounts.len(), "local accounts found");
        Ok(())
    }
}

fn parse_passwd(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let _password = fields.next()?;
            let uid = fields.next()?;
            Some((uid.to_string(), name.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwd_lines_yield_uid_and_name() {
        let text = "root:x:0:0:root:/root:/bin/bash\n\
                    daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
                    alice:x:1000:1000:Alice:/home/alice:/bin/zsh\n";
        let users = parse_passwd(text);
        assert_eq!(users.len(), 3);
        assert_eq!(users[0], ("0".to_string(), "root".to_string()));
        assert_eq!(users[2], ("1000".to_string(), "alice".to_string()));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse_passwd("# comment\nbroken-line\n").is_empty());
    }
}
