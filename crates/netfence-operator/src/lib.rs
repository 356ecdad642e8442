//! netfence operator: watches SecurityPolicy resources and keeps the
//! networking backend in line with them

#![deny(missing_docs)]

/// Command-line and environment configuration
pub mod config;
/// SecurityPolicy controller and garbage collector
pub mod controller;
