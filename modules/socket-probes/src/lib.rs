//! Socket-table probes: live connections, standard protocol tagging and
//! process-user linking.

mod appuser;
mod netstat;
mod procnet;
mod standard;

pub use appuser::AppUserModule;
pub use netstat::NetstatModule;
pub use standard::StandardProtocolModule;

use situation_core::Module;

pub fn modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(NetstatModule),
        Box::new(StandardProtocolModule),
        Box::new(AppUserModule),
    ]
}
