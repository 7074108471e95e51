//! CLI command implementations.
//!
//! This module contains the implementation of each CLI command.

pub mod dump;
pub mod export;
pub mod hexdump;
pub mod status;
pub mod versions;
