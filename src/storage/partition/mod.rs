//! Raw-mode partition engine

pub mod engine;
pub mod table;

pub use engine::*;
