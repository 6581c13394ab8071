//! Domain Module
//!
//! Core value types and the trait ports the engines are built against.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
