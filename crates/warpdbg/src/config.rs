//! Session options
//!
//! Options are plain fields with defaults; `SessionConfig::from_env` lets a
//! host override them through `WARPDBG_*` environment variables.

use std::env;

/// Static maximum number of devices.
pub const MAX_DEVICES: u32 = 16;
/// Static maximum number of SMs per device.
pub const MAX_SMS: u32 = 256;
/// Static maximum number of warps per SM.
pub const MAX_WARPS: u32 = 64;
/// Static maximum number of lanes per warp.
pub const MAX_LANES: u32 = 32;
/// Registers below this number are cached per lane.
pub const CACHED_REGISTERS: u32 = 256;
/// Registers are fetched in aligned batches of this size.
pub const REGISTER_BATCH: u32 = 32;

/// Which kernel launch/termination notices are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelEventFilter {
    /// Report application kernels
    pub application: bool,
    /// Report system (runtime-internal) kernels
    pub system: bool,
    /// Only report kernels nested less than this many levels deep
    pub max_depth: Option<u32>,
}

impl KernelEventFilter {
    pub const fn none() -> Self {
        Self { application: false, system: false, max_depth: None }
    }

    pub const fn all() -> Self {
        Self { application: true, system: true, max_depth: None }
    }

    /// Parse `none`, `application`, `system` or `all`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "none" => Some(Self::none()),
            "application" => Some(Self { application: true, ..Self::none() }),
            "system" => Some(Self { system: true, ..Self::none() }),
            "all" => Some(Self::all()),
            _ => None,
        }
    }
}

impl Default for KernelEventFilter {
    fn default() -> Self {
        Self { application: true, system: false, max_depth: None }
    }
}

/// Options that shape how a session talks to the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Step whole straight-line runs in one request instead of one instruction at a time
    pub single_stepping_optimizations: bool,
    /// Every step or resume may move any warp on the device
    pub software_preemption: bool,
    /// Kernel event reporting
    pub kernel_events: KernelEventFilter,
    /// Maximum number of devices the session will track
    pub max_devices: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            single_stepping_optimizations: true,
            software_preemption: false,
            kernel_events: KernelEventFilter::default(),
            max_devices: MAX_DEVICES,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl SessionConfig {
    /// Defaults, overridden by any `WARPDBG_*` variables that are set and parse.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup("WARPDBG_STEP_OPTIMIZATIONS").as_deref().and_then(parse_flag) {
            config.single_stepping_optimizations = v;
        }
        if let Some(v) = lookup("WARPDBG_SOFTWARE_PREEMPTION").as_deref().and_then(parse_flag) {
            config.software_preemption = v;
        }
        if let Some(filter) = lookup("WARPDBG_KERNEL_EVENTS")
            .as_deref()
            .and_then(KernelEventFilter::parse)
        {
            config.kernel_events = filter;
        }
        if let Some(depth) = lookup("WARPDBG_KERNEL_EVENTS_DEPTH").and_then(|v| v.trim().parse().ok()) {
            config.kernel_events.max_depth = Some(depth);
        }
        config
    }
}
