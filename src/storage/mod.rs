//! Storage Module
//!
//! Everything that mutates host storage: the named lock manager, the
//! command executor, and the LVM and partition engines built on them.

pub mod executor;
pub mod lock;
pub mod lvm;
pub mod partition;

pub use executor::*;
pub use lock::*;
pub use lvm::LvmEngine;
pub use partition::PartitionEngine;
