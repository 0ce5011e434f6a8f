//! Relational store for discovered inventory.
//!
//! One scan writes machines, NICs, subnets, applications, endpoints, flows,
//! packages and users through idempotent upserts keyed on the uniqueness
//! tuples of the schema. The store is shared across scans (and possibly
//! across agents pointing at the same file), so every writer must converge
//! instead of duplicating rows.

mod apps;
mod dialect;
mod fingerprint;
mod machine;
mod models;
mod network;
mod open;
mod packages;
mod schema;
mod snapshot;

pub use dialect::Dialect;
pub use fingerprint::Identity;
pub use models::*;
pub use network::strip_prefix_len;
pub use open::{Store, StoreError};
