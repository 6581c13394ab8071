//! Hardware Discovery Module
//!
//! Enumerates the block devices attached to this node.

pub mod scanner;

pub use scanner::*;
