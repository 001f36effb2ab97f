//! Resource Lifecycle Module
//!
//! Owns every mount created during a run and guarantees each one a release
//! path, including processes that keep a mount busy.

pub mod holders;
pub mod mounts;

pub use holders::*;
pub use mounts::*;
