//! Virtualisation probes: docker containers, vmware guests and ssh banner
//! evidence on already-discovered endpoints.

mod docker;
mod ssh;
mod vmware;

pub use docker::DockerModule;
pub use ssh::SshModule;
pub use vmware::VMwareModule;

use situation_core::Module;

pub fn modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(docker::DockerModule),
        Box::new(vmware::VMwareModule),
        Box::new(ssh::SshModule),
    ]
}
