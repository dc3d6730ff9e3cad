//! Error types for debug sessions

use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, DebugError>;

/// Failure reported by the debug target transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// The transport could not complete the request
    #[error("debug API call {call} failed: {reason}")]
    CallFailed {
        /// Name of the failing call
        call: &'static str,
        /// Transport-provided reason
        reason: String,
    },

    /// The target refused to step or resume the requested warps
    #[error("cannot execute warps on device {dev} sm {sm}")]
    ExecutionRefused {
        /// Device index
        dev: u32,
        /// SM index
        sm: u32,
    },

    /// The target no longer exists or was detached
    #[error("target is not attached")]
    Detached,
}

/// Errors that can occur during session operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DebugError {
    /// Transport failure
    #[error(transparent)]
    Target(#[from] TargetError),

    /// Operation needs a focus on the device and none is set
    #[error("no focus on a device thread")]
    NoFocus,

    /// No autostep region is being handled
    #[error("no autostep in progress")]
    NoAutostep,

    /// No breakpoint with this number
    #[error("no breakpoint number {0}")]
    UnknownBreakpoint(u32),

    /// Coordinates do not name an existing, valid hardware location
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),

    /// Breakpoint location could not be resolved to an address
    #[error("no code at {0}")]
    NoCode(String),
}
