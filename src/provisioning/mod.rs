//! Provisioning Module
//!
//! The phase state machine, the context it runs with and the orchestrator
//! that drives a complete install or a bootloader repair.

pub mod context;
pub mod orchestrator;
pub mod phases;

pub use context::*;
pub use orchestrator::*;
pub use phases::*;
