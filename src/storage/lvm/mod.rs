//! LVM thin volume engine and report parsing

pub mod engine;
pub mod report;

pub use engine::*;
