//! Boot Module
//!
//! Firmware detection, bootloader installation with per-target fallback
//! chains, a hand-written fallback menu and post-install checks.

pub mod firmware;
pub mod installer;
pub mod menu;
pub mod verify;

pub use firmware::*;
pub use installer::*;
pub use menu::*;
pub use verify::*;
