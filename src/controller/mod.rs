//! Controller Module
//!
//! Background loops that keep the node converged: the reconciliation loop
//! for VG membership and the consistency sweep for unreferenced resources.

pub mod reconciler;
pub mod retry;
pub mod sweep;

pub use reconciler::*;
pub use retry::*;
pub use sweep::*;
