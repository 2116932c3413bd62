//! Foundation utilities shared by the workspace engine crates.

pub mod command_stream;
pub mod error;
pub mod file_system;
pub mod naming;

pub use command_stream::{is_tool_installed, run_captured, run_checked, CommandOptions, CommandOutput};
pub use error::{CoreError, Result};
pub use file_system::write_atomic;
