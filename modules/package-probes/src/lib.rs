//! Package manager probes: installed packages and their links to running
//! applications.

mod dpkg;
mod manager;
mod msi;
mod rpm;
mod rpmdb;
mod zypper;

pub use dpkg::DpkgModule;
pub use msi::MsiModule;
pub use rpm::RpmModule;
pub use zypper::ZypperModule;

use situation_core::Module;

pub fn modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(DpkgModule),
        Box::new(RpmModule),
        Box::new(ZypperModule),
        Box::new(MsiModule),
    ]
}
