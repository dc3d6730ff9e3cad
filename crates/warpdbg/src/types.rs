//! Core value types exchanged with the debug target

use crate::mask::LaneMask;
use std::fmt;

/// Process-unique kernel identifier, assigned in creation order.
pub type KernelId = u64;

/// Device-unique grid identifier, increasing with launch order.
pub type GridId = u64;

/// A three-component index or extent (block index, thread index, grid dimensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Static description of a device, queried once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Number of streaming multiprocessors
    pub num_sms: u32,
    /// Warp slots per SM
    pub num_warps: u32,
    /// Lanes per warp
    pub num_lanes: u32,
    /// General-purpose registers per lane
    pub num_registers: u32,
    /// Predicate registers per lane
    pub num_predicates: u32,
    /// Marketing/device type name
    pub device_type: String,
    /// Instruction set name, e.g. `sm_75`
    pub sm_type: String,
    /// Encoded instruction size in bytes
    pub inst_size: u32,
}

/// Per-lane part of a warp state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneSnapshot {
    pub thread_idx: Dim3,
    pub virtual_pc: u64,
    pub exception: ExceptionKind,
}

/// Everything the target reports about a warp in one round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarpSnapshot {
    pub grid_id: GridId,
    pub block_idx: Dim3,
    pub valid_lanes: LaneMask,
    pub active_lanes: LaneMask,
    /// Program counter of the faulting instruction, when the hardware recorded one
    pub error_pc: Option<u64>,
    /// One entry per lane slot; entries of invalid lanes are ignored
    pub lanes: Vec<LaneSnapshot>,
}

/// Exception raised by a lane, warp or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExceptionKind {
    #[default]
    None,
    IllegalAddress,
    MisalignedAddress,
    OutOfRangeAddress,
    IllegalInstruction,
    StackOverflow,
    HardwareStackOverflow,
    Assert,
    Unknown(u32),
}

impl ExceptionKind {
    pub fn is_none(&self) -> bool {
        matches!(self, ExceptionKind::None)
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionKind::None => write!(f, "no exception"),
            ExceptionKind::IllegalAddress => write!(f, "Lane Illegal Address"),
            ExceptionKind::MisalignedAddress => write!(f, "Lane Misaligned Address"),
            ExceptionKind::OutOfRangeAddress => write!(f, "Lane Out Of Range Address"),
            ExceptionKind::IllegalInstruction => write!(f, "Warp Illegal Instruction"),
            ExceptionKind::StackOverflow => write!(f, "Lane User Stack Overflow"),
            ExceptionKind::HardwareStackOverflow => write!(f, "Warp Hardware Stack Overflow"),
            ExceptionKind::Assert => write!(f, "Warp Assert"),
            ExceptionKind::Unknown(code) => write!(f, "Unknown Exception {}", code),
        }
    }
}

/// Whether a grid was launched by the application or by the runtime itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelType {
    Application,
    System,
}

/// Who launched a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelOrigin {
    Host,
    Device,
}

/// Launch description of a grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridInfo {
    pub dev: u32,
    pub grid_id: GridId,
    /// Address of the kernel entry point
    pub function_entry: u64,
    pub context: u64,
    pub module: u64,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub kernel_type: KernelType,
    pub origin: KernelOrigin,
    /// Grid that launched this one, for device-launched grids
    pub parent_grid_id: Option<GridId>,
    /// Launch arguments pre-rendered by the target, if it can
    pub args: Option<String>,
}

/// Execution status of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridStatus {
    Invalid,
    Pending,
    Active,
    Sleeping,
    Terminated,
    Undetermined,
}

impl GridStatus {
    /// Whether the grid still has warps on the hardware or may resume them.
    pub fn is_present(&self) -> bool {
        matches!(self, GridStatus::Active | GridStatus::Sleeping)
    }
}

/// Notification delivered through the target's event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ContextCreate { dev: u32, context: u64 },
    ContextDestroy { dev: u32, context: u64 },
    ModuleLoad { dev: u32, context: u64, module: u64 },
    ModuleUnload { dev: u32, context: u64, module: u64 },
    GridLaunch { dev: u32, grid_id: GridId },
    GridTerminated { dev: u32, grid_id: GridId },
    DeviceException { dev: u32 },
    Timeout,
}
