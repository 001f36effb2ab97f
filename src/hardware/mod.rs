//! Hardware Module
//!
//! Provides device discovery and redundancy-aware topology planning.

pub mod discovery;
pub mod topology;

pub use discovery::*;
pub use topology::*;
