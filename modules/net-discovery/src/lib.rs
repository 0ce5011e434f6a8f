//! Neighbour discovery over the local L2/L3: ICMP sweep, ARP harvest,
//! MAC vendor resolution, TCP scan, reverse DNS and SNMP walks.

mod arp;
mod ber;
mod icmp;
mod macvendor;
mod oui;
mod ping;
mod reverse;
mod snmp;
mod tcpscan;

pub use arp::ArpModule;
pub use macvendor::MacVendorModule;
pub use ping::PingModule;
pub use reverse::ReverseLookupModule;
pub use snmp::SnmpModule;
pub use tcpscan::TcpScanModule;

use situation_core::Module;

pub fn modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(PingModule),
        Box::new(ArpModule),
        Box::new(MacVendorModule),
        Box::new(TcpScanModule),
        Box::new(ReverseLookupModule),
        Box::new(SnmpModule),
    ]
}
