//! Debugging session that owns the state cache, kernel registry, breakpoints
//! and autostep engine for one debug target.

use crate::autostep::{AutostepException, AutostepPhase, AutostepState, StepRecord};
use crate::breakpoints::{AutostepLength, BreakLocation, Breakpoint, BreakpointId, BreakpointManager};
use crate::config::SessionConfig;
use crate::coords::Coords;
use crate::error::{DebugError, Result};
use crate::kernels::KernelRegistry;
use crate::source_map::CodeInfo;
use crate::state::SystemState;
use crate::target::DebugTarget;
use crate::types::Event;
use common::{create_logger, Logger};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};

/// What the other subsystems operate against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    /// A host thread stopped at `pc`
    Host { pc: u64 },
    /// A device lane
    Device(Coords),
}

pub(crate) struct Loggers {
    pub state: Logger,
    pub kernel: Logger,
    pub iterator: Logger,
    pub autostep: Logger,
    pub session: Logger,
}

impl Loggers {
    fn new() -> Self {
        Self {
            state: create_logger("state"),
            kernel: create_logger("kernel"),
            iterator: create_logger("iterator"),
            autostep: create_logger("autostep"),
            session: create_logger("session"),
        }
    }
}

/// A debugging session generic over the target implementation.
pub struct DebugSession<A: DebugTarget> {
    /// The debug API transport
    pub(crate) api: A,
    /// Line table and disassembly for device code
    pub(crate) code: Box<dyn CodeInfo>,
    pub(crate) config: SessionConfig,
    pub(crate) state: SystemState,
    pub(crate) kernels: KernelRegistry,
    pub(crate) breakpoints: BreakpointManager,
    pub(crate) focus: Option<Focus>,
    pub(crate) autostep: Option<AutostepState>,
    pub(crate) autostep_phase: AutostepPhase,
    pub(crate) autostep_exception: Option<AutostepException>,
    /// Resume address left by a failed autostep step request
    pub(crate) autostep_fallback: Option<u64>,
    pub(crate) last_step: Option<StepRecord>,
    /// Live contexts by id, with their device
    pub(crate) contexts: BTreeMap<u64, u32>,
    /// Loaded modules by id, with their context
    pub(crate) modules: BTreeMap<u64, u64>,
    /// Incremented on every resume or step
    pub(crate) clock: u64,
    pub(crate) logs: Loggers,
    /// Relay for notifications raised off the controlling thread
    pub(crate) notify_tx: Sender<Event>,
    pub(crate) notify_rx: Receiver<Event>,
    /// Captured user-visible output
    messages: Vec<String>,
}

impl<A: DebugTarget> DebugSession<A> {
    /// Open a session on `api`.
    ///
    /// Only the device count is queried here; every other piece of state is
    /// fetched when first needed.
    pub fn open(api: A, code: Box<dyn CodeInfo>, config: SessionConfig) -> Result<Self> {
        let num_devices = api.device_count()?;
        let (notify_tx, notify_rx) = mpsc::channel();
        let session = Self {
            api,
            code,
            state: SystemState::new(num_devices, config.max_devices),
            config,
            kernels: KernelRegistry::new(),
            breakpoints: BreakpointManager::new(),
            focus: None,
            autostep: None,
            autostep_phase: AutostepPhase::Idle,
            autostep_exception: None,
            autostep_fallback: None,
            last_step: None,
            contexts: BTreeMap::new(),
            modules: BTreeMap::new(),
            clock: 0,
            logs: Loggers::new(),
            notify_tx,
            notify_rx,
            messages: Vec::new(),
        };
        common::log!(session.logs.session, "opened with {} device(s)", num_devices);
        Ok(session)
    }

    /// End the session, resuming every device it left suspended, and hand
    /// the target back.
    pub fn close(mut self) -> Result<A> {
        self.cleanup_autostep_state();
        for dev in 0..self.device_count() {
            if self.device_is_suspended(dev) {
                self.device_resume(dev)?;
            }
        }
        self.kernels.clear();
        common::log!(self.logs.session, "closed");
        Ok(self.api)
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Direct access to the target. Cached state is not invalidated.
    pub fn api_mut(&mut self) -> &mut A {
        &mut self.api
    }

    pub fn code(&self) -> &dyn CodeInfo {
        self.code.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Report something to the user.
    pub(crate) fn say(&mut self, msg: String) {
        log::info!("{}", msg);
        self.messages.push(msg);
    }

    /// Warn the user.
    pub(crate) fn warn(&mut self, msg: String) {
        log::warn!("{}", msg);
        self.messages.push(msg);
    }

    /// Everything reported since the last `take_messages`
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn take_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }

    // ========================================================================
    // Focus
    // ========================================================================

    pub fn focus(&self) -> Option<&Focus> {
        self.focus.as_ref()
    }

    /// Device coordinates in focus, if the focus is on the device.
    pub fn focus_coords(&self) -> Option<Coords> {
        match self.focus {
            Some(Focus::Device(c)) => Some(c),
            _ => None,
        }
    }

    pub fn focus_is_device(&self) -> bool {
        matches!(self.focus, Some(Focus::Device(_)))
    }

    pub fn set_focus_host(&mut self, pc: u64) {
        self.focus = Some(Focus::Host { pc });
    }

    /// Focus a device lane given by its physical coordinates. The logical
    /// part is filled in from the state cache.
    pub fn set_focus_device(&mut self, coords: Coords) -> Result<()> {
        let (Some(dev), Some(sm), Some(wp), Some(ln)) = (coords.dev, coords.sm, coords.wp, coords.ln) else {
            return Err(DebugError::InvalidCoordinates(coords.to_string()));
        };
        let (num_sms, num_warps, num_lanes) = if dev < self.device_count() {
            self.device_geometry(dev)?
        } else {
            (0, 0, 0)
        };
        if sm >= num_sms || wp >= num_warps || ln >= num_lanes || !self.warp_is_valid(dev, sm, wp)? {
            return Err(DebugError::InvalidCoordinates(coords.to_string()));
        }

        let mut focus = Coords::physical(dev, sm, wp, ln)
            .with_kernel(self.warp_kernel(dev, sm, wp)?)
            .with_grid(self.warp_grid_id(dev, sm, wp)?)
            .with_block(self.warp_block_idx(dev, sm, wp)?);
        if self.lane_is_valid(dev, sm, wp, ln)? {
            focus = focus.with_thread(self.lane_thread_idx(dev, sm, wp, ln)?);
        }
        common::log_detail!(self.logs.session, "focus {}", focus);
        self.focus = Some(Focus::Device(focus));
        Ok(())
    }

    pub fn clear_focus(&mut self) {
        self.focus = None;
    }

    /// Let every device run again. The focus does not survive a resume.
    pub fn resume(&mut self) -> Result<()> {
        self.focus = None;
        for dev in 0..self.device_count() {
            self.device_resume(dev)?;
        }
        Ok(())
    }

    /// Stop every device.
    pub fn suspend(&mut self) -> Result<()> {
        for dev in 0..self.device_count() {
            if !self.device_is_suspended(dev) {
                self.device_suspend(dev)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Breakpoints
    // ========================================================================

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    /// Add a breakpoint, optionally with an autostep region starting at it.
    pub fn add_breakpoint(
        &mut self,
        location: BreakLocation,
        autostep: Option<AutostepLength>,
    ) -> Result<BreakpointId> {
        let address = BreakpointManager::resolve(self.code.as_ref(), &location)
            .ok_or_else(|| DebugError::NoCode(location.to_string()))?;
        let id = self.breakpoints.insert(location, address, autostep);
        common::log!(self.logs.session, "breakpoint {} at 0x{:x}{}", id, address,
            if autostep.is_some() { " (autostep)" } else { "" });
        Ok(id)
    }

    pub fn enable_breakpoint(&mut self, id: BreakpointId) -> Result<()> {
        if self.breakpoints.enable(id) {
            Ok(())
        } else {
            Err(DebugError::UnknownBreakpoint(id.0))
        }
    }

    pub fn disable_breakpoint(&mut self, id: BreakpointId) -> Result<()> {
        if self.breakpoints.disable(id) {
            Ok(())
        } else {
            Err(DebugError::UnknownBreakpoint(id.0))
        }
    }

    pub fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<Breakpoint> {
        self.breakpoints.delete(id).ok_or(DebugError::UnknownBreakpoint(id.0))
    }

    /// Count a stop at `pc` against the enabled breakpoint planted there.
    pub fn breakpoint_hit(&mut self, pc: u64) -> Option<BreakpointId> {
        let id = self.breakpoints.check_breakpoint(pc)?;
        self.breakpoints.record_hit(id);
        Some(id)
    }
}
