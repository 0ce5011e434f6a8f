//! Probes that read the local OS and upsert facts onto the host machine:
//! basic identity, CPU, GPUs, disks, chassis, network interfaces, local
//! users, plus the fingerprint module that reconciles the host with a
//! machine already present in a shared store.

mod basic;
mod chassis;
mod cpu;
mod disk;
mod fingerprint;
mod gpu;
mod network;
mod users;

pub use basic::HostBasicModule;
pub use chassis::ChassisModule;
pub use cpu::HostCpuModule;
pub use disk::HostDiskModule;
pub use fingerprint::FingerprintModule;
pub use gpu::HostGpuModule;
pub use network::HostNetworkModule;
pub use users::LocalUsersModule;

use situation_core::Module;

pub fn modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(HostBasicModule),
        Box::new(HostCpuModule),
        Box::new(HostGpuModule),
        Box::new(HostDiskModule),
        Box::new(ChassisModule),
        Box::new(HostNetworkModule),
        Box::new(LocalUsersModule),
        Box::new(FingerprintModule),
    ]
}
