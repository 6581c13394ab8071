//! Hardware Classification Module
//!
//! Sorts discovered disks into selector groups.

pub mod classifier;

pub use classifier::*;
