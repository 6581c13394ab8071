//! Events Module
//!
//! The volume event bus and its two standing observers: the capacity
//! publisher and the Prometheus metrics collector.

pub mod bus;
pub mod capacity;
pub mod metrics;

pub use bus::*;
pub use capacity::*;
pub use metrics::*;
