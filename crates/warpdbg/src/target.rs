//! Target abstraction for the accelerator debug API
//!
//! The [`DebugTarget`] trait abstracts over the transport that reaches the
//! hardware (a local driver, a remote stub, a core file, a simulator), so the
//! state cache and stepping logic are backend-independent. A session picks
//! its implementation once, when it is opened.

use crate::error::TargetError;
use crate::mask::{SmMask, WarpMask};
use crate::types::{DeviceSpec, Event, GridId, GridInfo, GridStatus, WarpSnapshot};

/// Raw query/mutate interface keyed by device, SM, warp and lane.
///
/// Reads take `&self`; anything that changes execution state takes `&mut self`.
pub trait DebugTarget {
    /// Number of devices visible to the debugger.
    fn device_count(&self) -> Result<u32, TargetError>;

    /// Static description of a device.
    fn device_spec(&self, dev: u32) -> Result<DeviceSpec, TargetError>;

    /// SMs of `dev` that currently report an exception.
    fn read_device_exception_state(&self, dev: u32) -> Result<SmMask, TargetError>;

    /// Warps resident on the SM.
    fn read_valid_warps(&self, dev: u32, sm: u32) -> Result<WarpMask, TargetError>;

    /// Warps of the SM stopped at a breakpoint.
    fn read_broken_warps(&self, dev: u32, sm: u32) -> Result<WarpMask, TargetError>;

    /// Block, grid, lane masks and per-lane state of a warp in one round trip.
    fn read_warp_state(&self, dev: u32, sm: u32, wp: u32) -> Result<WarpSnapshot, TargetError>;

    /// Physical program counter of a lane.
    fn read_pc(&self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64, TargetError>;

    /// Read one register.
    fn read_register(&self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32)
        -> Result<u32, TargetError>;

    /// Read `count` consecutive registers starting at `first`.
    fn read_register_range(
        &self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        first: u32,
        count: u32,
    ) -> Result<Vec<u32>, TargetError>;

    /// Write one register.
    fn write_register(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        regno: u32,
        value: u32,
    ) -> Result<(), TargetError>;

    /// Read the first `count` predicate registers.
    fn read_predicates(&self, dev: u32, sm: u32, wp: u32, ln: u32, count: u32)
        -> Result<Vec<bool>, TargetError>;

    /// Write the first `values.len()` predicate registers.
    fn write_predicates(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        values: &[bool],
    ) -> Result<(), TargetError>;

    /// Call depth of a lane; 0 means the kernel's outermost frame.
    fn read_call_depth(&self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u32, TargetError>;

    /// Address of the instruction preceding `addr` in the device code.
    fn previous_address(&self, dev: u32, addr: u64) -> Result<u64, TargetError>;

    /// Step `wp` by `nsteps` instructions. Returns every warp that moved.
    fn single_step_warp(&mut self, dev: u32, sm: u32, wp: u32, nsteps: u32)
        -> Result<WarpMask, TargetError>;

    /// Run the masked warps until they reach `pc`.
    fn resume_warps_until_pc(&mut self, dev: u32, sm: u32, mask: WarpMask, pc: u64)
        -> Result<(), TargetError>;

    /// Resume a suspended device.
    fn resume_device(&mut self, dev: u32) -> Result<(), TargetError>;

    /// Suspend a running device.
    fn suspend_device(&mut self, dev: u32) -> Result<(), TargetError>;

    /// Launch description of a grid.
    fn grid_info(&self, dev: u32, grid_id: GridId) -> Result<GridInfo, TargetError>;

    /// Current status of a grid.
    fn grid_status(&self, dev: u32, grid_id: GridId) -> Result<GridStatus, TargetError>;

    /// Next queued notification, if any.
    fn next_event(&mut self) -> Result<Option<Event>, TargetError>;
}
