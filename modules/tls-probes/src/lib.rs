//! TLS-layer probes: certificate facts, JA4 fingerprints and SaaS
//! attribution for endpoints discovered by the socket and network probes.

mod dial;
mod ja4;
mod saas;
mod tls;

pub use ja4::Ja4Module;
pub use saas::SaasModule;
pub use tls::TlsModule;

use situation_core::Module;

pub fn modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(tls::TlsModule),
        Box::new(ja4::Ja4Module),
        Box::new(saas::SaasModule),
    ]
}
