//! Hardware Module
//!
//! Disk discovery and classification for the reconciliation loop.

pub mod discovery;
pub mod classification;

pub use discovery::*;
pub use classification::*;
