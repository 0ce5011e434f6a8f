use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ModuleError;
use crate::module::{Module, ScanContext};
use crate::supervisor::{NoopSupervisor, Supervisor};

/// Final status of one module run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStatus {
    Success,
    NotApplicable(String),
    MissingPrivilege(String),
    Failed(String),
}

impl ModuleStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, ModuleStatus::Failed(_))
    }

    /// Message carried into the payload error list, None for success.
    pub fn report(&self) -> Option<String> {
        match self {
            ModuleStatus::Success => None,
            ModuleStatus::NotApplicable(m) => Some(format!("not applicable: {m}")),
            ModuleStatus::MissingPrivilege(m) => Some(format!("missing privilege: {m}")),
            ModuleStatus::Failed(m) => Some(m.clone()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("dependency cycle through module {0:?}")]
    Cycle(String),
    #[error("module {module:?} depends on unscheduled module {dependency:?}")]
    UnknownDependency { module: String, dependency: String },
    #[error("module {module:?} failed in fail-fast mode: {message}")]
    FailFast { module: String, message: String },
}

/// Runs modules exactly once per scan, dependency-ordered, with failure
/// isolation. One bad probe never cancels the scan unless fail-fast is on.
pub struct Scheduler {
    modules: Vec<Box<dyn Module>>,
    disabled: HashSet<String>,
    strict_deps: bool,
    fail_fast: bool,
    supervisor: Arc<dyn Supervisor>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            modules: Vec::new(),
            disabled: HashSet::new(),
            strict_deps: false,
            fail_fast: false,
            supervisor: Arc::new(NoopSupervisor),
        }
    }

    pub fn register(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    pub fn disable(&mut self, name: &str) {
        self.disabled.insert(name.to_string());
    }

    pub fn strict_deps(&mut self, strict: bool) {
        self.strict_deps = strict;
    }

    pub fn fail_fast(&mut self, fail_fast: bool) {
        self.fail_fast = fail_fast;
    }

    pub fn set_supervisor(&mut self, supervisor: Arc<dyn Supervisor>) {
        self.supervisor = supervisor;
    }

    /// Declares every module's options on the binder.
    pub fn bind_all(&self, config: &mut Config) {
        for module in &self.modules {
            module.bind(config);
        }
    }

    pub fn enabled_names(&self) -> Vec<&'static str> {
        self.modules
            .iter()
            .map(|m| m.name())
            .filter(|n| !self.disabled.contains(*n))
            .collect()
    }

    /// DFS topological order over the enabled modules. Dependencies on
    /// unscheduled modules are dropped unless strict mode is on; a cycle is
    /// fatal before any module runs.
    fn order(&self) -> Result<Vec<usize>, SchedulerError> {
        let index: HashMap<&str, usize> = self
            .modules
            .iter()
            .enumerate()
            .filter(|(_, m)| !self.disabled.contains(m.name()))
            .map(|(i, m)| (m.name(), i))
            .collect();

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut marks = vec![0u8; self.modules.len()];
        let mut order = Vec::with_capacity(index.len());

        fn visit(
            idx: usize,
            modules: &[Box<dyn Module>],
            index: &HashMap<&str, usize>,
            strict: bool,
            marks: &mut [u8],
            order: &mut Vec<usize>,
        ) -> Result<(), SchedulerError> {
            match marks[idx] {
                2 => return Ok(()),
                1 => return Err(SchedulerError::Cycle(modules[idx].name().to_string())),
                _ => {}
            }
            marks[idx] = 1;
            for dep in modules[idx].dependencies() {
                match index.get(dep) {
                    Some(&dep_idx) => {
                        visit(dep_idx, modules, index, strict, marks, order)?;
                    }
                    None if strict => {
                        return Err(SchedulerError::UnknownDependency {
                            module: modules[idx].name().to_string(),
                            dependency: dep.to_string(),
                        });
                    }
                    None => {
                        debug!(
                            module = modules[idx].name(),
                            dependency = dep,
                            "dropping dependency on unscheduled module"
                        );
                    }
                }
            }
            marks[idx] = 2;
            order.push(idx);
            Ok(())
        }

        for (i, module) in self.modules.iter().enumerate() {
            if self.disabled.contains(module.name()) {
                continue;
            }
            visit(i, &self.modules, &index, self.strict_deps, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    /// Runs the scan. The returned list holds one status per executed
    /// module, in execution order.
    pub async fn run(
        &self,
        ctx: &ScanContext,
    ) -> Result<Vec<(String, ModuleStatus)>, SchedulerError> {
        let order = self.order()?;
        let mut statuses = Vec::with_capacity(order.len());

        for idx in order {
            let module = &self.modules[idx];
            let name = module.name();
            self.supervisor.module_started(name);
            info!(module = name, "running module");
            let started = std::time::Instant::now();

            let status = match module.run(ctx).await {
                Ok(()) => ModuleStatus::Success,
                Err(ModuleError::NotApplicable(msg)) => {
                    debug!(module = name, reason = %msg, "module not applicable");
                    ModuleStatus::NotApplicable(msg)
                }
                Err(ModuleError::MissingPrivilege(msg)) => {
                    warn!(module = name, reason = %msg, "module needs more privilege");
                    ModuleStatus::MissingPrivilege(msg)
                }
                Err(ModuleError::Failure(err)) => {
                    error!(module = name, error = %format!("{err:#}"), "module failed");
                    ModuleStatus::Failed(format!("{err:#}"))
                }
            };
            debug!(module = name, elapsed_ms = started.elapsed().as_millis() as u64, "module done");
            self.supervisor.module_finished(name, &status);

            let failed = status.is_error();
            let message = status.report().unwrap_or_default();
            statuses.push((name.to_string(), status));
            if failed && self.fail_fast {
                return Err(SchedulerError::FailFast {
                    module: name.to_string(),
                    message,
                });
            }
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use situation_store::Store;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Probe {
        name: &'static str,
        deps: &'static [&'static str],
        fail: bool,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Module for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }

        async fn run(&self, _ctx: &ScanContext) -> Result<(), ModuleError> {
            self.trace.lock().unwrap().push(self.name);
            if self.fail {
                return Err(ModuleError::Failure(anyhow::anyhow!("boom")));
            }
            Ok(())
        }
    }

    fn ctx() -> ScanContext {
        let agent = Uuid::new_v4();
        ScanContext {
            agent,
            store: Arc::new(Store::open_in_memory(agent).unwrap()),
            config: Arc::new(Config::new()),
        }
    }

    fn probe(
        name: &'static str,
        deps: &'static [&'static str],
        fail: bool,
        trace: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Box<dyn Module> {
        Box::new(Probe {
            name,
            deps,
            fail,
            trace: trace.clone(),
        })
    }

    #[tokio::test]
    async fn dependencies_run_first() {
        let trace = Arc::new(Mutex::new(vec![]));
        let mut sched = Scheduler::new();
        sched.register(probe("saas", &["tls"], false, &trace));
        sched.register(probe("tls", &["netstat"], false, &trace));
        sched.register(probe("netstat", &[], false, &trace));
        let statuses = sched.run(&ctx()).await.unwrap();
        assert_eq!(statuses.len(), 3);
        assert_eq!(*trace.lock().unwrap(), vec!["netstat", "tls", "saas"]);
    }

    #[tokio::test]
    async fn cycle_is_fatal_before_any_module_runs() {
        let trace = Arc::new(Mutex::new(vec![]));
        let mut sched = Scheduler::new();
        sched.register(probe("a", &["b"], false, &trace));
        sched.register(probe("b", &["a"], false, &trace));
        let err = sched.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Cycle(_)));
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_dependency_is_dropped_unless_strict() {
        let trace = Arc::new(Mutex::new(vec![]));
        let mut sched = Scheduler::new();
        sched.register(probe("tls", &["netstat"], false, &trace));
        assert!(sched.run(&ctx()).await.is_ok());

        sched.strict_deps(true);
        let err = sched.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownDependency { .. }));
    }

    #[tokio::test]
    async fn failure_is_isolated_by_default() {
        let trace = Arc::new(Mutex::new(vec![]));
        let mut sched = Scheduler::new();
        sched.register(probe("ping", &[], true, &trace));
        sched.register(probe("arp", &["ping"], false, &trace));
        let statuses = sched.run(&ctx()).await.unwrap();
        assert!(statuses[0].1.is_error());
        assert_eq!(statuses[1].1, ModuleStatus::Success);
        // the dependent still ran
        assert_eq!(*trace.lock().unwrap(), vec!["ping", "arp"]);
    }

    #[tokio::test]
    async fn fail_fast_aborts_after_the_failing_module() {
        let trace = Arc::new(Mutex::new(vec![]));
        let mut sched = Scheduler::new();
        sched.register(probe("ping", &[], true, &trace));
        sched.register(probe("arp", &["ping"], false, &trace));
        sched.fail_fast(true);
        let err = sched.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::FailFast { .. }));
        assert_eq!(*trace.lock().unwrap(), vec!["ping"]);
    }

    #[tokio::test]
    async fn disabled_modules_do_not_run() {
        let trace = Arc::new(Mutex::new(vec![]));
        let mut sched = Scheduler::new();
        sched.register(probe("ping", &[], false, &trace));
        sched.register(probe("arp", &["ping"], false, &trace));
        sched.disable("ping");
        let statuses = sched.run(&ctx()).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(*trace.lock().unwrap(), vec!["arp"]);
    }
}
