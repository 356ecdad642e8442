//! SecurityPolicy reconciliation core
//!
//! Keeps an indexed local mirror of the backend's policies, rules and groups
//! and turns each SecurityPolicy change into a single minimal hierarchical
//! patch.
//!
//! - [`store`]: per-kind store with an owner-tag index
//! - [`sync`]: concurrent initial population of the stores
//! - [`compare`] and [`assemble`]: diff and write ordering
//! - [`builder`]: SecurityPolicy to backend objects
//! - [`client`]: backend trait and HTTP implementation
//! - [`service`]: create/update, delete and owner inventory

#![deny(missing_docs)]

pub mod assemble;
pub mod builder;
pub mod client;
pub mod compare;
pub mod service;
pub mod store;
pub mod sync;

pub use builder::PolicyBuilder;
pub use client::{BackendConfig, HttpBackend, PolicyBackend};
pub use service::{DeleteTarget, SecurityPolicyService};
pub use store::IndexedStore;
pub use sync::PolicyStores;
