//! The scan loop: build the module registry, run the scheduler, assemble
//! the payload and hand it to the backends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use situation_core::{Config, Module, ModuleStatus, ScanContext, Scheduler};
use situation_store::{ModuleReport, Payload, PayloadExtra, Perfs, Store};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backends;

/// Every probe module this binary ships, in registration order. Execution
/// order is decided by the scheduler from the declared dependencies.
pub fn registry() -> Vec<Box<dyn Module>> {
    let mut out: Vec<Box<dyn Module>> = Vec::new();
    out.extend(host_probes::modules());
    out.extend(net_discovery::modules());
    out.extend(socket_probes::modules());
    out.extend(package_probes::modules());
    out.extend(tls_probes::modules());
    out.extend(virt_probes::modules());
    out
}

/// Options owned by the binary itself, on top of what modules declare.
pub fn bind(config: &mut Config) {
    config.define("store", "situation.db", "store path, or :memory: for a dry run");
    config.define("scans", 1, "number of scans to perform, 0 means forever");
    config.define("period", 60, "seconds between two scans");
    backends::bind(config);
}

pub async fn run_loop(scheduler: Scheduler, config: Config) -> Result<()> {
    let config = Arc::new(config);
    let scans: u64 = config.get("scans")?;
    let period = Duration::from_secs(config.get("period")?);
    let agent = crate::agent::agent();
    let store = Arc::new(Store::open(&config.get_string("store")?, agent)?);
    let mut backends = backends::init_all(&config)?;

    let ctx = ScanContext {
        agent,
        store: store.clone(),
        config: config.clone(),
    };

    let mut n = 0u64;
    loop {
        let started = Instant::now();
        let statuses = scheduler.run(&ctx).await?;
        // NICs learned from the network without an owner get a stub machine
        store.ensure_no_orphan_nics()?;

        let payload = build_payload(&store, agent, started.elapsed(), &statuses)?;
        info!(
            scan = n + 1,
            machines = payload.machines.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scan done"
        );
        if let Err(e) = backends::write_all(&mut backends, &payload).await {
            warn!(error = %format!("{e:#}"), "payload delivery incomplete");
        }

        n += 1;
        if scans != 0 && n >= scans {
            break;
        }
        tokio::time::sleep(period).await;
    }

    backends::close_all(&mut backends)?;
    Ok(())
}

fn build_payload(
    store: &Store,
    agent: Uuid,
    elapsed: Duration,
    statuses: &[(String, ModuleStatus)],
) -> Result<Payload> {
    let errors = statuses
        .iter()
        .filter_map(|(module, status)| {
            status.report().map(|message| ModuleReport {
                module: module.clone(),
                message,
            })
        })
        .collect();

    Ok(Payload {
        machines: store.snapshot_machines()?,
        extra: PayloadExtra {
            agent,
            version: situation_core::version().to_string(),
            duration: elapsed.as_nanos().min(i64::MAX as u128) as i64,
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339)?,
            errors,
            perfs: perfs(),
        },
    })
}

#[cfg(target_os = "linux")]
fn perfs() -> Perfs {
    // statm counts pages: total program size first, resident set second
    let page = 4096u64;
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| {
            let mut fields = s.split_whitespace();
            let size: u64 = fields.next()?.parse().ok()?;
            let resident: u64 = fields.next()?.parse().ok()?;
            Some(Perfs {
                heap_alloc: resident * page,
                heap_sys: size * page,
            })
        })
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
fn perfs() -> Perfs {
    Perfs::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn registry_names_are_unique() {
        let modules = registry();
        let names: HashSet<_> = modules.iter().map(|m| m.name()).collect();
        assert_eq!(names.len(), modules.len());
    }

    #[test]
    fn every_dependency_is_registered() {
        let modules = registry();
        let names: HashSet<_> = modules.iter().map(|m| m.name()).collect();
        for module in &modules {
            for dep in module.dependencies() {
                assert!(names.contains(dep), "{} depends on unknown {dep}", module.name());
            }
        }
    }

    #[test]
    fn the_dependency_graph_is_acyclic() {
        let modules = registry();
        let index: std::collections::HashMap<&str, usize> =
            modules.iter().enumerate().map(|(i, m)| (m.name(), i)).collect();
        // 0 unvisited, 1 on stack, 2 done
        fn visit(
            i: usize,
            modules: &[Box<dyn Module>],
            index: &std::collections::HashMap<&str, usize>,
            marks: &mut [u8],
        ) {
            assert_ne!(marks[i], 1, "cycle through {}", modules[i].name());
            if marks[i] == 2 {
                return;
            }
            marks[i] = 1;
            for dep in modules[i].dependencies() {
                visit(index[dep], modules, index, marks);
            }
            marks[i] = 2;
        }
        let mut marks = vec![0u8; modules.len()];
        for i in 0..modules.len() {
            visit(i, &modules, &index, &mut marks);
        }
    }

    #[test]
    fn binary_and_module_options_bind_without_conflict() {
        let mut config = Config::new();
        bind(&mut config);
        let scheduler = {
            let mut s = Scheduler::new();
            for module in registry() {
                s.register(module);
            }
            s
        };
        scheduler.bind_all(&mut config);
        assert_eq!(config.get::<u64>("scans").unwrap(), 1);
        assert_eq!(config.get_string("vmware.username").unwrap(), "root");
        // both handshake probes wait one second by default
        assert_eq!(config.get::<u64>("tls.timeout").unwrap(), 1000);
        assert_eq!(config.get::<u64>("ja4.timeout").unwrap(), 1000);
    }

    #[test]
    fn payload_carries_module_errors() {
        let agent = Uuid::new_v4();
        let store = Store::open_in_memory(agent).unwrap();
        let statuses = vec![
            ("ping".to_string(), ModuleStatus::Success),
            ("snmp".to_string(), ModuleStatus::Failed("timeout".to_string())),
            (
                "msi".to_string(),
                ModuleStatus::NotApplicable("windows only".to_string()),
            ),
        ];
        let payload =
            build_payload(&store, agent, Duration::from_millis(12), &statuses).unwrap();
        assert_eq!(payload.extra.agent, agent);
        assert_eq!(payload.extra.duration, 12_000_000);
        assert_eq!(payload.extra.errors.len(), 2);
        assert_eq!(payload.extra.errors[0].module, "snmp");
        assert!(payload.extra.errors[1].message.contains("not applicable"));
    }
}
