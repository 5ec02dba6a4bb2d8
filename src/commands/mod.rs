//! CLI command implementations.
//!
//! Each submodule implements one CLI command, with formatting and core logic
//! kept in pure functions for testability.

pub mod init;
pub mod run;
pub mod serve;
