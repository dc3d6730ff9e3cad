//! Accelerator debugger core
//!
//! This crate mirrors the execution state of a massively parallel device
//! (devices, SMs, warps, lanes) behind a lazily filled cache, tracks the
//! kernels running on it, walks the hardware with filtered iterators, and
//! steps warps through bounded autostep regions.
//!
//! The main types are:
//! - [`DebugSession`] - Owns the cache, kernel registry and breakpoints for one target
//! - [`DebugTarget`] - The debug API transport a session talks to
//! - [`Coords`] - Physical and logical coordinates
//! - [`CoordIterator`] - Ordered, filtered walk over the hardware

pub mod arch;
pub mod autostep;
pub mod breakpoints;
pub mod cached;
pub mod config;
pub mod coords;
pub mod error;
pub mod events;
pub mod inspection;
pub mod iterator;
pub mod kernels;
pub mod mask;
pub mod session;
pub mod source_map;
pub mod state;
pub mod stepping;
pub mod target;
pub mod types;

#[cfg(test)]
mod mock;

pub use autostep::{AutostepException, AutostepOutcome, AutostepPhase, AutostepStatus};
pub use breakpoints::{AutostepLength, BreakLocation, Breakpoint, BreakpointId, BreakpointManager};
pub use config::{KernelEventFilter, SessionConfig};
pub use coords::Coords;
pub use error::{DebugError, Result, TargetError};
pub use inspection::Inspector;
pub use iterator::{CoordIterator, IteratorKind, SelectFlags};
pub use kernels::{Kernel, KernelRegistry};
pub use mask::{DeviceMask, LaneMask, SmMask, WarpMask};
pub use session::{DebugSession, Focus};
pub use source_map::{CodeInfo, SourceLocation, SourceMapper};
pub use stepping::{StepUnit, Stepper};
pub use target::DebugTarget;
pub use types::{
    DeviceSpec, Dim3, Event, ExceptionKind, GridId, GridInfo, GridStatus, KernelId, KernelOrigin,
    KernelType, LaneSnapshot, WarpSnapshot,
};
