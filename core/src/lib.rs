//! Core plumbing of the agent: the module contract, the dependency-ordered
//! scheduler, the bounded worker pool and the layered config binder.

mod config;
mod error;
mod module;
mod pool;
mod scheduler;
mod supervisor;

pub use config::Config;
pub use error::{join_errors, ModuleError};
pub use module::{Module, ScanContext};
pub use pool::run_pool;
pub use scheduler::{ModuleStatus, Scheduler, SchedulerError};
pub use supervisor::{NoopSupervisor, Supervisor};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
