//! Custom Resource Definitions for the Local Storage Manager
//!
//! This module contains all CRD types:
//! - LocalVolume: desired node-local volumes and snapshots
//! - NodeStorage: published per-node capacity

pub mod local_volume;
pub mod node_storage;

pub use local_volume::*;
pub use node_storage::*;
