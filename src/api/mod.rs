//! HTTP API
//!
//! Health, readiness, Prometheus metrics and read-only storage views.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
