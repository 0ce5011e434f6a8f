use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};

/// Reads installed software from the Windows registry uninstall keys:
/// `HKLM\SOFTWARE\...\Uninstall` for system-wide packages, the WOW6432Node
/// variant for 32-bit ones, and `HKCU` for per-user installs.
pub struct MsiModule;

#[async_trait]
impl Module for MsiModule {
    fn name(&self) -> &'static str {
        "msi"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["standard-protocol"]
    }

    #[cfg(not(windows))]
    async fn run(&self, _ctx: &ScanContext) -> Result<(), ModuleError> {
        Err(ModuleError::not_applicable("the msi registry exists on windows only"))
    }

    #[cfg(windows)]
    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        use crate::manager::absorb_packages;

        let host = ctx.store.get_or_create_host()?;
        let packages = windows::installed_packages().await;
        absorb_packages(ctx, host.id, "msi", packages)
    }
}

#[cfg(windows)]
mod windows {
    use std::path::{Path, PathBuf};

    use situation_store::Package;
    use tracing::{debug, error};
    use winreg::enums::{HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_READ};
    use winreg::RegKey;

    const UNINSTALL: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";
    const UNINSTALL_32: &str = r"SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall";
    const EXE_DEPTH: usize = 3;

    /// The three uninstall roots are walked concurrently, one task per root.
    pub(super) async fn installed_packages() -> Vec<Package> {
        let roots = [
            (HKEY_LOCAL_MACHINE, UNINSTALL),
            (HKEY_LOCAL_MACHINE, UNINSTALL_32),
            (HKEY_CURRENT_USER, UNINSTALL),
        ];
        let mut tasks = Vec::new();
        for (hive, path) in roots {
            tasks.push(tokio::task::spawn_blocking(move || read_root(hive, path)));
        }
        let mut packages = Vec::new();
        for task in tasks {
            match task.await {
                Ok(found) => packages.extend(found),
                Err(e) => error!(error = %e, "registry walker aborted"),
            }
        }
        packages
    }

    fn read_root(hive: winreg::HKEY, path: &str) -> Vec<Package> {
        let root = RegKey::predef(hive);
        let Ok(key) = root.open_subkey_with_flags(path, KEY_READ) else {
            debug!(key = path, "registry key unreadable");
            return Vec::new();
        };
        let mut packages = Vec::new();
        for name in key.enum_keys().flatten() {
            let Ok(sub) = key.open_subkey_with_flags(&name, KEY_READ) else {
                continue;
            };
            // SystemComponent=1 hides an entry from "Add or remove programs"
            if sub.get_value::<u32, _>("SystemComponent").unwrap_or(0) == 1 {
                continue;
            }
            let display_name: String = sub.get_value("DisplayName").unwrap_or_default();
            if display_name.is_empty() {
                continue;
            }
            let mut pkg = Package {
                name: display_name,
                version: sub.get_value("DisplayVersion").unwrap_or_default(),
                vendor: sub.get_value("Publisher").unwrap_or_default(),
                ..Package::default()
            };
            if let Ok(date) = sub.get_value::<String, _>("InstallDate") {
                pkg.install_time_unix = parse_install_date(&date);
            }
            if let Ok(location) = sub.get_value::<String, _>("InstallLocation") {
                pkg.files = find_executables(Path::new(&location), EXE_DEPTH);
            }
            packages.push(pkg);
        }
        packages
    }

    /// InstallDate is `YYYYMMDD` local time; midnight UTC is close enough.
    fn parse_install_date(value: &str) -> Option<i64> {
        let fmt = time::format_description::parse("[year][month][day]").ok()?;
        let date = time::Date::parse(value, &fmt).ok()?;
        Some(date.midnight().assume_utc().unix_timestamp())
    }

    /// `*.exe` files under `root`, at most `max_depth` directories deep.
    /// Drive roots are refused, some uninstall entries point at `C:\`.
    fn find_executables(root: &Path, max_depth: usize) -> Vec<String> {
        let mut files = Vec::new();
        if root.parent().is_none() {
            return files;
        }
        let mut stack: Vec<(PathBuf, usize)> = vec![(root.to_path_buf(), 0)];
        while let Some((dir, depth)) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(kind) = entry.file_type() else {
                    continue;
                };
                if kind.is_dir() && depth + 1 < max_depth {
                    stack.push((path, depth + 1));
                } else if kind.is_file()
                    && path.extension().is_some_and(|e| e.eq_ignore_ascii_case("exe"))
                {
                    files.push(path.to_string_lossy().into_owned());
                }
            }
        }
        files
    }
}
