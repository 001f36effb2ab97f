//! Topology Module
//!
//! Groups devices by capacity and plans the pool's vdev layout.

pub mod planner;
pub mod policy;

pub use planner::*;
pub use policy::*;
