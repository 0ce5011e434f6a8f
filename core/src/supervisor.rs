use crate::scheduler::ModuleStatus;

/// Observation seam around module execution. The default implementation does
/// nothing; a production deployment can plug a tracing backend here.
pub trait Supervisor: Send + Sync {
    fn module_started(&self, _name: &str) {}
    fn module_finished(&self, _name: &str, _status: &ModuleStatus) {}
}

pub struct NoopSupervisor;

impl Supervisor for NoopSupervisor {}
