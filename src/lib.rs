//! Edge proxy with a shared stale-while-revalidate response cache.
//!
//! The binary in `main.rs` wires these modules together; integration tests
//! build a [`proxy::ProxyState`] directly.

pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod proxy;
pub mod telemetry;
