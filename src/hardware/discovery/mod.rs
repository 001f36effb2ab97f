//! Hardware Discovery Module
//!
//! Discovers and enumerates candidate pool devices on Linux systems.

pub mod scanner;

pub use scanner::*;
