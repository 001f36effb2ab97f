//! Storage Module
//!
//! Tool resolution, device wiping, pool construction and the dataset
//! hierarchy of the new system.

pub mod builder;
pub mod datasets;
pub mod resolver;
pub mod status;
pub mod wipe;

pub use builder::*;
pub use datasets::*;
pub use resolver::*;
pub use status::*;
pub use wipe::*;
