//! Recurring-scan installation through a cron drop-in.

use anyhow::Result;
use clap::Args;

#[cfg(target_os = "linux")]
const CRON_FILE: &str = "/etc/cron.d/situation";

#[derive(Args, Debug)]
pub struct TaskArgs {
    /// Remove the scheduled task instead of installing it
    #[arg(long)]
    pub uninstall: bool,
    /// Minutes between two scans
    #[arg(long, default_value_t = 60)]
    pub every: u64,
}

/// Cron schedule for a scan every `minutes`. Periods of an hour or more are
/// rounded down to whole hours.
fn schedule(minutes: u64) -> String {
    if minutes < 60 {
        format!("*/{} * * * *", minutes.max(1))
    } else {
        format!("0 */{} * * *", (minutes / 60).min(23))
    }
}

fn cron_line(minutes: u64, exe: &str) -> String {
    format!("{} root {} run\n", schedule(minutes), exe)
}

#[cfg(target_os = "linux")]
pub fn task(args: &TaskArgs) -> Result<()> {
    use anyhow::Context as _;
    use tracing::info;

    if args.uninstall {
        match std::fs::remove_file(CRON_FILE) {
            Ok(()) => info!(path = CRON_FILE, "scheduled task removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = CRON_FILE, "no scheduled task installed")
            }
            Err(e) => return Err(e).context("cannot remove the cron file"),
        }
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    let exe = exe.to_str().context("executable path is not valid UTF-8")?;
    std::fs::write(CRON_FILE, cron_line(args.every, exe))
        .with_context(|| format!("cannot write {CRON_FILE}"))?;
    info!(path = CRON_FILE, every = args.every, "scheduled task installed");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn task(_args: &TaskArgs) -> Result<()> {
    anyhow::bail!("scheduled task install is linux only")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedules_follow_the_period() {
        assert_eq!(schedule(15), "*/15 * * * *");
        assert_eq!(schedule(60), "0 */1 * * *");
        assert_eq!(schedule(180), "0 */3 * * *");
        assert_eq!(schedule(0), "*/1 * * * *");
    }

    #[test]
    fn the_cron_line_runs_a_scan_as_root() {
        assert_eq!(
            cron_line(30, "/usr/local/bin/situation"),
            "*/30 * * * * root /usr/local/bin/situation run\n"
        );
    }
}
