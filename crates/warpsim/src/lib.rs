//! Simulated accelerator and scenario runner
//!
//! [`SimTarget`] is a software device that implements the debug API, and
//! [`Scenario`] drives a debug session against it from a line-oriented
//! script. Together they let the debugger core be exercised end to end
//! without hardware.

pub mod commands;
pub mod machine;
pub mod program;
pub mod script;

pub use machine::{SimLane, SimTarget, SimWarp};
pub use program::Program;
pub use script::{run_commands, Scenario, ScriptError};
