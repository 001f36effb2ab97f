//! Domain Module
//!
//! Core data model and port traits shared by every component.

pub mod ports;

pub use ports::*;
