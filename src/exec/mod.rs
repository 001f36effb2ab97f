//! Execution Module
//!
//! External command execution, the retry-with-backoff combinator, and
//! ordered fallback ladders shared by every component that drives tools.

pub mod ladder;
pub mod retry;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use ladder::*;
pub use retry::*;
pub use runner::*;
