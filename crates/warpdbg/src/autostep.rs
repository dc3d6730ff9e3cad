//! Autostep engine
//!
//! An autostep breakpoint carries a length (N lines or N instructions). When
//! it is hit, the engine walks every warp of the current grid that sits on
//! the breakpoint through the region, one warp at a time:
//!
//! ```text
//! Idle -> Initializing -> SteppingWarp <-> SwitchingWarp -> Done
//!                               \______________________________-> Aborted
//! ```
//!
//! Each step request covers as many instructions as can be executed without
//! crossing control flow, the end of the region or the end of the kernel.
//! After the request completes the engine measures how far the warp really
//! got and either plans the next request, continues into an adjacent region,
//! or moves on to the next warp.
//!
//! The engine never blocks; the host debugger (or [`DebugSession::run_autostep`])
//! drives it by alternating `step_autostep` and `update_autostep_state`.

use crate::arch::sm_type_supports_autostep;
use crate::breakpoints::{Breakpoint, BreakpointId};
use crate::coords::Coords;
use crate::error::{DebugError, Result};
use crate::iterator::{CoordIterator, SelectFlags};
use crate::mask::LaneMask;
use crate::session::{DebugSession, Focus};
use crate::source_map::{CodeInfo, SourceLocation};
use crate::stepping::{StepUnit, Stepper, WindowRequest};
use crate::target::DebugTarget;
use crate::types::ExceptionKind;
use std::sync::atomic::{AtomicBool, Ordering};

/// Where the engine is in its life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutostepPhase {
    Idle,
    Initializing,
    SteppingWarp,
    SwitchingWarp,
    Done,
    Aborted,
}

/// Result of an engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutostepStatus {
    /// More stepping is needed
    Continue,
    /// The region is finished (or could not be started)
    Done,
    /// Stepping failed; the host should resume normally, stopping at
    /// [`DebugSession::autostep_fallback_pc`]
    Fallback,
}

/// How a [`DebugSession::run_autostep`] call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutostepOutcome {
    Completed,
    Exception(AutostepException),
    Interrupted,
    /// Stepping failed. The host plants a temporary breakpoint at
    /// `resume_to` and resumes the device normally.
    Fallback { resume_to: u64 },
}

/// Exception caught while autostepping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutostepException {
    pub pc: u64,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub kind: ExceptionKind,
    /// The faulting instruction is known exactly
    pub precise: bool,
    /// Lane the focus was moved to, for device exceptions
    pub coords: Option<Coords>,
}

/// The single step request most recently issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRecord {
    pub dev: u32,
    pub sm: u32,
    pub wp: u32,
    /// Virtual PC of the warp before the step
    pub pc: u64,
    /// Lanes that took part in the step
    pub stepped_lanes: LaneMask,
}

/// Per-warp data kept while the focus is on the device
#[derive(Debug, Clone)]
pub struct DeviceAutostep {
    iter: CoordIterator,
    /// Warp being stepped; its thread index identifies it across epochs
    pub cur_coords: Coords,
    /// Lane the step plan was made for
    pub cur_ln: u32,
    pub nsteps: u32,
    pub inst_size: u32,
}

/// Progress through one autostep region
#[derive(Debug, Clone)]
pub struct AutostepState {
    pub breakpoint: BreakpointId,
    pub start_pc: u64,
    /// Start of the first region of the run. Adjacent regions keep it, so
    /// every further warp is still taken from here.
    pub origin_pc: u64,
    pub start_line: Option<SourceLocation>,
    pub insn_stepping: bool,
    /// Requested length of the region
    pub length: u32,
    pub remaining: i64,
    pub cur_pc: u64,
    pub cur_line: Option<SourceLocation>,
    pub end_pc: u64,
    pub insns_stepped: u32,
    pub lines_stepped: u32,
    pub device: Option<DeviceAutostep>,
    /// Overlapping autosteps already reported. Carried across warps and
    /// adjacent regions of one run; every `initialize_autostep` starts empty.
    warned_overlaps: Vec<BreakpointId>,
}

impl AutostepState {
    fn new(bp: &Breakpoint, pc: u64, code: &dyn CodeInfo) -> Self {
        let length = bp.autostep.map(|a| a.count).unwrap_or(0);
        let insn_stepping = matches!(bp.autostep.map(|a| a.unit), Some(StepUnit::Instructions));
        let start_line = code.line_for_pc(pc);
        Self {
            breakpoint: bp.id,
            start_pc: pc,
            origin_pc: pc,
            cur_line: start_line.clone(),
            start_line,
            insn_stepping,
            length,
            remaining: length as i64,
            cur_pc: pc,
            end_pc: pc,
            insns_stepped: 0,
            lines_stepped: 0,
            device: None,
            warned_overlaps: Vec::new(),
        }
    }
}

fn describe_pc(pc: u64, line: Option<&SourceLocation>) -> String {
    match line {
        Some(l) => format!("{}:{} (0x{:x})", l.file, l.line, pc),
        None => format!("0x{:x}", pc),
    }
}

impl<A: DebugTarget> DebugSession<A> {
    /// An autostep region is being handled.
    pub fn autostep_pending(&self) -> bool {
        self.autostep.is_some()
    }

    pub fn autostep_state(&self) -> Option<&AutostepState> {
        self.autostep.as_ref()
    }

    pub fn autostep_phase(&self) -> AutostepPhase {
        self.autostep_phase
    }

    /// Exception reported by the last autostep, if any.
    pub fn autostep_exception(&self) -> Option<&AutostepException> {
        self.autostep_exception.as_ref()
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.last_step.as_ref()
    }

    /// Where a normal resume should stop after the last step request
    /// failed: the end of the window that could not be stepped.
    pub fn autostep_fallback_pc(&self) -> Option<u64> {
        self.autostep_fallback
    }

    fn set_phase(&mut self, phase: AutostepPhase) {
        if self.autostep_phase != phase {
            common::log_detail!(self.logs.autostep, "phase {:?} -> {:?}", self.autostep_phase, phase);
            self.autostep_phase = phase;
        }
    }

    /// Fresh region state for the autostep breakpoint at `pc`.
    fn region_at(&self, pc: u64) -> Result<AutostepState> {
        let bp = self
            .breakpoints
            .find_autostep_by_addr(pc)
            .ok_or(DebugError::NoAutostep)?;
        Ok(AutostepState::new(bp, pc, self.code.as_ref()))
    }

    /// Begin handling the autostep breakpoint at `pc` for the current focus.
    pub fn initialize_autostep(&mut self, pc: u64) -> Result<AutostepStatus> {
        self.autostep = None;
        self.autostep_exception = None;
        self.autostep_fallback = None;
        self.set_phase(AutostepPhase::Initializing);

        let mut st = self.region_at(pc)?;
        common::log!(self.logs.autostep, "autostep {} at 0x{:x}: {} {}", st.breakpoint, pc,
            st.length, if st.insn_stepping { "instructions" } else { "lines" });

        if let Some(Focus::Device(focus)) = self.focus {
            let dev = focus.dev.ok_or(DebugError::NoFocus)?;
            if !self.fermi_or_better(st.start_pc, dev)? {
                self.set_phase(AutostepPhase::Aborted);
                return Ok(AutostepStatus::Done);
            }
            if !self.initialize_device_autostep(&mut st, focus)? {
                self.set_phase(AutostepPhase::Done);
                return Ok(AutostepStatus::Done);
            }
        }

        self.autostep = Some(st);
        Ok(AutostepStatus::Continue)
    }

    fn initialize_device_autostep(&mut self, st: &mut AutostepState, focus: Coords) -> Result<bool> {
        let mut filter = Coords::wildcard();
        filter.dev = focus.dev;
        filter.grid_id = match focus.grid_id {
            Some(g) => Some(g),
            None => match (focus.dev, focus.sm, focus.wp) {
                (Some(d), Some(s), Some(w)) => Some(self.warp_grid_id(d, s, w)?),
                _ => None,
            },
        };

        let mut iter = CoordIterator::warps(filter, SelectFlags::VALID | SelectFlags::BREAKPOINT);
        iter.start(self)?;
        let first = iter.current().copied();
        st.device = Some(DeviceAutostep {
            iter,
            cur_coords: first.unwrap_or(focus),
            cur_ln: 0,
            nsteps: 1,
            inst_size: 0,
        });

        if self.astep_warp_valid(st, first)? {
            if let Some(c) = first {
                self.take_warp(st, c)?;
            }
        } else if !self.select_next_valid_warp(st)? {
            return Ok(false);
        }

        Ok(!self.set_next_device_iteration(st)?)
    }

    /// Autostep requires compute capability 2.0; older devices get the
    /// breakpoint disabled.
    fn fermi_or_better(&mut self, astep_pc: u64, dev: u32) -> Result<bool> {
        let sm_type = self.device_spec(dev)?.sm_type.clone();
        if sm_type_supports_autostep(&sm_type) {
            return Ok(true);
        }
        if let Some(id) = self.breakpoints.find_autostep_by_addr(astep_pc).map(|bp| bp.id) {
            self.warn(format!(
                "Disabling autostep {} on device {} because autostep requires compute capability 2.0 or higher.",
                id, dev
            ));
            self.breakpoints.disable(id);
        }
        Ok(false)
    }

    /// Whether `coords` names a warp that can be stepped through the
    /// run: still resident, breakpoint enabled, device capable, and
    /// sitting where the run started.
    fn astep_warp_valid(&mut self, st: &AutostepState, coords: Option<Coords>) -> Result<bool> {
        let Some(coords) = coords else {
            return Ok(false);
        };
        let Some(c) = self.resolve_physical(&coords)? else {
            return Ok(false);
        };
        let (Some(dev), Some(sm), Some(wp)) = (c.dev, c.sm, c.wp) else {
            return Ok(false);
        };
        if !self.warp_is_valid(dev, sm, wp)? {
            return Ok(false);
        }
        if self.breakpoints.find_autostep_by_addr(st.origin_pc).is_none() {
            return Ok(false);
        }
        if !self.fermi_or_better(st.origin_pc, dev)? {
            return Ok(false);
        }
        if self.warp_lowest_active_lane(dev, sm, wp)?.is_none() {
            return Ok(false);
        }
        Ok(self.warp_active_virtual_pc(dev, sm, wp)? == st.origin_pc)
    }

    /// Focus the lowest active lane of the warp at `c` and restart the
    /// region from its PC, keeping the iterator.
    fn take_warp(&mut self, st: &mut AutostepState, c: Coords) -> Result<()> {
        let (Some(dev), Some(sm), Some(wp)) = (c.dev, c.sm, c.wp) else {
            return Err(DebugError::InvalidCoordinates(c.to_string()));
        };
        let ln = self
            .warp_lowest_active_lane(dev, sm, wp)?
            .ok_or_else(|| DebugError::InvalidCoordinates(c.to_string()))?;
        let thread_idx = self.lane_thread_idx(dev, sm, wp, ln)?;
        let coords = c.with_lane(ln).with_thread(thread_idx);
        self.set_focus_device(coords)?;

        let warp_pc = self.warp_active_virtual_pc(dev, sm, wp)?;
        let mut fresh = self.region_at(warp_pc)?;
        fresh.warned_overlaps = std::mem::take(&mut st.warned_overlaps);
        fresh.device = st.device.take().map(|d| DeviceAutostep {
            cur_coords: coords,
            cur_ln: ln,
            ..d
        });
        *st = fresh;
        common::log!(self.logs.autostep, "stepping warp {}/{}/{} lane {}, block {}, thread {}",
            dev, sm, wp, ln, coords.block_idx.unwrap_or_default(), thread_idx);
        Ok(())
    }

    /// Move to the next warp of the iteration that can be stepped through
    /// the region. False when none is left.
    fn select_next_valid_warp(&mut self, st: &mut AutostepState) -> Result<bool> {
        self.set_phase(AutostepPhase::SwitchingWarp);
        let Some(mut device) = st.device.take() else {
            return Ok(false);
        };
        let prev = device.cur_coords;

        let mut next = None;
        while self.focus_is_device() && !device.iter.end() {
            device.iter.next(self)?;
            let Some(candidate) = device.iter.current().copied() else {
                break;
            };
            if candidate.same_warp(&prev) {
                continue;
            }
            if self.astep_warp_valid(st, Some(candidate))? {
                next = Some(candidate);
                break;
            }
        }
        st.device = Some(device);

        match next {
            Some(c) => {
                self.take_warp(st, c)?;
                Ok(true)
            }
            None => {
                common::log!(self.logs.autostep, "no more warps at 0x{:x}", st.origin_pc);
                Ok(false)
            }
        }
    }

    /// Plan the next step request for the selected warp. True means the
    /// warp is at the end of its kernel and stepping must stop.
    fn set_next_device_iteration(&mut self, st: &mut AutostepState) -> Result<bool> {
        let Some(c) = st.device.as_ref().map(|d| d.cur_coords) else {
            return Err(DebugError::NoFocus);
        };
        let (Some(dev), Some(sm), Some(wp)) = (c.dev, c.sm, c.wp) else {
            return Err(DebugError::InvalidCoordinates(c.to_string()));
        };
        let ln = st.device.as_ref().map(|d| d.cur_ln).unwrap_or(0);

        let cur_pc = self.warp_active_virtual_pc(dev, sm, wp)?;
        let outermost = self.lane_call_depth(dev, sm, wp, ln)? == 0;
        let kernel = self.warp_kernel(dev, sm, wp)?;
        let default_inst_size = self.device_spec(dev)?.inst_size;
        let optimizations = self.config.single_stepping_optimizations;

        let code = self.kernel_code(Some(kernel));
        let cur_line = code.line_for_pc(cur_pc);
        let req = WindowRequest {
            cur_pc,
            cur_line: cur_line.as_ref(),
            remaining: st.remaining,
            insn_stepping: st.insn_stepping,
            optimizations,
            outermost,
            default_inst_size,
        };
        let Some(window) = Stepper::plan_window(&code, &req) else {
            common::log!(self.logs.autostep, "0x{:x} is at the end of the kernel", cur_pc);
            return Ok(true);
        };

        common::log!(self.logs.autostep, "issuing single step {} steps (from 0x{:x} to 0x{:x})",
            window.nsteps, cur_pc, window.end_pc);
        st.cur_pc = cur_pc;
        st.end_pc = window.end_pc;
        st.cur_line = cur_line;
        if let Some(d) = st.device.as_mut() {
            d.nsteps = window.nsteps;
            d.inst_size = window.inst_size;
        }
        self.set_phase(AutostepPhase::SteppingWarp);
        Ok(false)
    }

    /// Issue the planned step request for the selected warp.
    pub fn step_autostep(&mut self) -> Result<AutostepStatus> {
        let st = self.autostep.as_ref().ok_or(DebugError::NoAutostep)?;
        let device = st.device.as_ref().ok_or(DebugError::NoFocus)?;
        let c = device.cur_coords;
        let nsteps = device.nsteps;
        let end_pc = st.end_pc;
        let (Some(dev), Some(sm), Some(wp)) = (c.dev, c.sm, c.wp) else {
            return Err(DebugError::InvalidCoordinates(c.to_string()));
        };

        let stepped_lanes = self.warp_active_lanes_mask(dev, sm, wp)?;
        let pc = self.warp_active_virtual_pc(dev, sm, wp)?;
        match self.warp_single_step(dev, sm, wp, nsteps) {
            Ok(_) => {
                self.last_step = Some(StepRecord { dev, sm, wp, pc, stepped_lanes });
                Ok(AutostepStatus::Continue)
            }
            Err(DebugError::Target(e)) => {
                self.warn(format!("Autostep could not single-step warp {}/{}/{}: {}", dev, sm, wp, e));
                self.autostep_fallback = Some(end_pc);
                self.set_phase(AutostepPhase::Aborted);
                self.cleanup_autostep_state();
                Ok(AutostepStatus::Fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// Account for the step that just completed. `pc` is the stop PC, used
    /// when the focus is on the host.
    pub fn update_autostep_state(&mut self, pc: u64) -> Result<AutostepStatus> {
        let mut st = self.autostep.take().ok_or(DebugError::NoAutostep)?;

        // The breakpoint may have been disabled or deleted since the last stop
        if self.breakpoints.find_autostep_by_addr(st.start_pc).is_none() {
            common::log!(self.logs.autostep, "autostep {} no longer enabled", st.breakpoint);
            self.set_phase(AutostepPhase::Aborted);
            self.cleanup_autostep_state();
            return Ok(AutostepStatus::Done);
        }

        let result = if self.focus_is_device() {
            self.update_device_autostep_state(&mut st)
        } else {
            self.update_host_autostep_state(&mut st, pc)
        };

        match result {
            Ok(AutostepStatus::Continue) => {
                self.autostep = Some(st);
                Ok(AutostepStatus::Continue)
            }
            Ok(status) => {
                self.cleanup_autostep_state();
                Ok(status)
            }
            Err(e) => {
                self.set_phase(AutostepPhase::Aborted);
                self.cleanup_autostep_state();
                Err(e)
            }
        }
    }

    fn check_overlapping_astep(&mut self, st: &mut AutostepState, pc: u64) {
        let Some(id) = self.breakpoints.find_autostep_by_addr(pc).map(|bp| bp.id) else {
            return;
        };
        if !st.warned_overlaps.contains(&id) {
            st.warned_overlaps.push(id);
            self.warn(format!("Overlapping autostep {} ignored", id));
        }
    }

    fn update_host_autostep_state(&mut self, st: &mut AutostepState, pc: u64) -> Result<AutostepStatus> {
        if st.insn_stepping {
            if pc != st.cur_pc {
                st.insns_stepped += 1;
                st.remaining -= 1;
                st.cur_pc = pc;
            }
        } else if let Some(line) = self.code.line_for_pc(pc) {
            if line.line != 0 && Some(line.line) != st.cur_line.as_ref().map(|l| l.line) {
                st.lines_stepped += 1;
                st.remaining -= 1;
                st.cur_line = Some(line);
                st.cur_pc = pc;
            }
        }

        if st.remaining > 0 {
            self.check_overlapping_astep(st, pc);
            return Ok(AutostepStatus::Continue);
        }
        self.set_phase(AutostepPhase::Done);
        Ok(AutostepStatus::Done)
    }

    fn update_device_autostep_state(&mut self, st: &mut AutostepState) -> Result<AutostepStatus> {
        let Some(device) = st.device.as_ref() else {
            return Err(DebugError::NoFocus);
        };
        let prev = device.cur_coords;
        let before_ln = device.cur_ln;
        let nsteps = device.nsteps;
        let inst_size = device.inst_size;

        // Locate the warp again; if its thread is gone the warp ran to completion
        let located = match self.resolve_physical(&prev)? {
            Some(c) => match (c.dev, c.sm, c.wp) {
                (Some(d), Some(s), Some(w)) if self.warp_is_valid(d, s, w)? => Some((c, d, s, w)),
                _ => None,
            },
            None => None,
        };
        let Some((c, dev, sm, wp)) = located else {
            common::log!(self.logs.autostep, "warp complete, block {}, thread {}",
                prev.block_idx.unwrap_or_default(), prev.thread_idx.unwrap_or_default());
            if !self.select_next_valid_warp(st)? {
                self.set_phase(AutostepPhase::Done);
                return Ok(AutostepStatus::Done);
            }
            return self.continue_or_stop(st);
        };

        let ln = c.ln.unwrap_or(before_ln);
        if let Some(d) = st.device.as_mut() {
            d.cur_coords = c;
            d.cur_ln = ln;
        }

        // A lane that diverged keeps stepping until it is active again
        if !self.lane_is_active(dev, sm, wp, ln)? {
            common::log_detail!(self.logs.autostep, "lane {} inactive, stepping on", ln);
            return Ok(AutostepStatus::Continue);
        }

        let after_pc = self.warp_active_virtual_pc(dev, sm, wp)?;
        let kernel = self.warp_kernel(dev, sm, wp)?;
        let before_pc = st.cur_pc;
        let (stepped, lines) = {
            let code = self.kernel_code(Some(kernel));
            if nsteps > 1 {
                (
                    Stepper::count_instructions(&code, before_pc, after_pc),
                    Stepper::count_lines(&code, before_pc, after_pc, inst_size),
                )
            } else {
                let after_line = code.line_for_pc(after_pc);
                (1, Stepper::lines_differ(st.cur_line.as_ref(), after_line.as_ref()) as u32)
            }
        };

        st.insns_stepped += stepped;
        st.lines_stepped += lines;
        let remaining = st.remaining - if st.insn_stepping { stepped as i64 } else { lines as i64 };
        common::log!(self.logs.autostep, "stepped {} instructions / {} lines ({} {} left), pc 0x{:x}",
            stepped, lines, remaining, if st.insn_stepping { "instructions" } else { "lines" }, after_pc);

        let overlap = self.breakpoints.find_autostep_by_addr(after_pc).map(|bp| bp.id);
        self.check_overlapping_astep(st, after_pc);

        if remaining > 0 {
            st.remaining = remaining;
        } else if overlap.is_some() {
            // Adjacent region: continue into it without switching warps
            let mut fresh = self.region_at(after_pc)?;
            fresh.origin_pc = st.origin_pc;
            fresh.warned_overlaps = std::mem::take(&mut st.warned_overlaps);
            fresh.device = st.device.take();
            *st = fresh;
            common::log!(self.logs.autostep, "continuing into autostep {} at 0x{:x}", st.breakpoint, after_pc);
        } else if !self.select_next_valid_warp(st)? {
            self.set_phase(AutostepPhase::Done);
            return Ok(AutostepStatus::Done);
        }

        self.continue_or_stop(st)
    }

    fn continue_or_stop(&mut self, st: &mut AutostepState) -> Result<AutostepStatus> {
        if self.set_next_device_iteration(st)? {
            self.set_phase(AutostepPhase::Done);
            return Ok(AutostepStatus::Done);
        }
        Ok(AutostepStatus::Continue)
    }

    /// Stop handling the current region.
    pub fn cleanup_autostep_state(&mut self) {
        if self.autostep.take().is_some() {
            common::log_detail!(self.logs.autostep, "cleanup");
        }
        if self.autostep_phase != AutostepPhase::Aborted {
            self.set_phase(AutostepPhase::Done);
        }
    }

    /// If the device stopped on an exception while autostepping, report
    /// where it most likely happened and end the region.
    pub fn print_exception_if_any(&mut self) -> Result<Option<AutostepException>> {
        let Some(st) = self.autostep.as_ref() else {
            return Ok(None);
        };
        let Some(device) = st.device.as_ref() else {
            return Ok(None);
        };
        let c = device.cur_coords;
        let before_ln = device.cur_ln;
        let nsteps = device.nsteps.max(1);
        let cur_pc = st.cur_pc;
        let (Some(dev), Some(sm), Some(wp)) = (c.dev, c.sm, c.wp) else {
            return Ok(None);
        };
        if !self.device_has_exception(dev)? {
            return Ok(None);
        }

        let warp_alive = self.warp_is_valid(dev, sm, wp)?;
        let lowest = if warp_alive { self.warp_lowest_active_lane(dev, sm, wp)? } else { None };
        let after_pc = match lowest {
            Some(_) => self.warp_active_virtual_pc(dev, sm, wp)?,
            None => cur_pc,
        };
        let divergent = !warp_alive || !self.lane_is_active(dev, sm, wp, before_ln)?;

        let last = self.last_step.filter(|s| s.dev == dev && s.sm == sm && s.wp == wp);
        let exception_pc = if nsteps > 1 {
            self.api.previous_address(dev, after_pc)?
        } else {
            last.map(|s| s.pc).unwrap_or(cur_pc)
        };

        // Another set of lanes may have run the step; blame one of them
        let mut focus_ln = before_ln;
        if let Some(step) = last {
            if !step.stepped_lanes.contains(before_ln) {
                if let Some(ln) = step.stepped_lanes.lowest() {
                    focus_ln = ln;
                }
            }
        }
        let mut coords = c.with_lane(focus_ln);
        let mut kind = ExceptionKind::None;
        if warp_alive && self.lane_is_valid(dev, sm, wp, focus_ln)? {
            coords = coords.with_thread(self.lane_thread_idx(dev, sm, wp, focus_ln)?);
            self.set_focus_device(coords)?;
            kind = self.lane_exception(dev, sm, wp, focus_ln)?;
            if kind.is_none() {
                for ln in self.warp_valid_lanes_mask(dev, sm, wp)?.iter() {
                    let k = self.lane_exception(dev, sm, wp, ln)?;
                    if !k.is_none() {
                        kind = k;
                        break;
                    }
                }
            }
        }

        let precise = !divergent && lowest == Some(before_ln) && nsteps == 1;
        let location = self.code.line_for_pc(exception_pc);
        let where_ = describe_pc(exception_pc, location.as_ref());
        if precise {
            self.say(format!("Autostep precisely caught exception at {}", where_));
        } else {
            self.say(format!(
                "Autostep caught exception at instruction before 0x{:x}\nThis is probably {}",
                after_pc, where_
            ));
        }

        let exception = AutostepException {
            pc: exception_pc,
            file: location.as_ref().map(|l| l.file.clone()),
            line: location.as_ref().map(|l| l.line),
            kind,
            precise,
            coords: Some(coords),
        };
        self.autostep_exception = Some(exception.clone());
        self.set_phase(AutostepPhase::Aborted);
        self.cleanup_autostep_state();
        Ok(Some(exception))
    }

    /// Report a host-side exception raised while autostepping; it happened
    /// at the last PC the region reached.
    pub fn report_host_exception(&mut self) -> Option<AutostepException> {
        let st = self.autostep.as_ref().filter(|st| st.device.is_none())?;
        let pc = st.cur_pc;
        let location = self.code.line_for_pc(pc);
        self.say(format!("Autostep precisely caught exception at {}", describe_pc(pc, location.as_ref())));
        let exception = AutostepException {
            pc,
            file: location.as_ref().map(|l| l.file.clone()),
            line: location.as_ref().map(|l| l.line),
            kind: ExceptionKind::Unknown(0),
            precise: true,
            coords: None,
        };
        self.autostep_exception = Some(exception.clone());
        self.set_phase(AutostepPhase::Aborted);
        self.cleanup_autostep_state();
        Some(exception)
    }

    /// `step_autostep` records the resume address before reporting a fallback
    fn fallback_outcome(&self) -> AutostepOutcome {
        AutostepOutcome::Fallback { resume_to: self.autostep_fallback.unwrap_or_default() }
    }

    /// Drive a pending device autostep to the end of its last region.
    /// `interrupt` is polled between step requests.
    pub fn run_autostep(&mut self, interrupt: &AtomicBool) -> Result<AutostepOutcome> {
        if !self.autostep_pending() {
            return Err(DebugError::NoAutostep);
        }
        if !self.focus_is_device() {
            return Err(DebugError::NoFocus);
        }

        loop {
            if interrupt.load(Ordering::SeqCst) {
                self.say("Autostep interrupted".to_string());
                self.set_phase(AutostepPhase::Aborted);
                self.cleanup_autostep_state();
                return Ok(AutostepOutcome::Interrupted);
            }

            if self.step_autostep()? == AutostepStatus::Fallback {
                return Ok(self.fallback_outcome());
            }
            if let Some(exception) = self.print_exception_if_any()? {
                return Ok(AutostepOutcome::Exception(exception));
            }

            let pc = self.autostep.as_ref().map(|st| st.cur_pc).unwrap_or(0);
            match self.update_autostep_state(pc)? {
                AutostepStatus::Continue => continue,
                AutostepStatus::Done => return Ok(AutostepOutcome::Completed),
                AutostepStatus::Fallback => return Ok(self.fallback_outcome()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::{AutostepLength, BreakLocation};
    use crate::config::SessionConfig;
    use crate::mock::{grid_info, spec, MockTarget};
    use crate::source_map::SourceMapper;
    use crate::types::GridStatus;
    use debuginfo::{DebugInfoBuilder, InstructionFlags, LineMappingFlags, SymbolKind};

    /// Straight-line kernel at 0x100..0x200, two 16-byte instructions per
    /// line starting at line 10; exit at 0x1f0.
    fn program() -> SourceMapper {
        let mut b = DebugInfoBuilder::new();
        let src = b.add_source("k.cu");
        let f = b.begin_function("k", src, 9, SymbolKind::Kernel);
        b.set_function_code_range(f, 0x100, 0x100);
        for i in 0..8u64 {
            b.add_line_mapping(0x100 + i * 0x20, src, 10 + i as u32, 1, LineMappingFlags::STATEMENT);
        }
        for addr in (0x100..0x200).step_by(16) {
            let flags = if addr == 0x1f0 { InstructionFlags::EXIT } else { InstructionFlags::empty() };
            b.add_instruction(addr, 16, "OP", flags, None);
        }
        b.end_function();
        SourceMapper::new(b.build())
    }

    fn session(warps: &[(u32, u32)]) -> DebugSession<MockTarget> {
        let mut target = MockTarget::new(vec![spec(2, 4, 32)]);
        for &(sm, wp) in warps {
            target.add_warp(0, sm, wp, 7, 0x100);
        }
        target.add_grid(grid_info(0, 7, 0x100, None), GridStatus::Active);
        DebugSession::open(target, Box::new(program()), SessionConfig::default()).unwrap()
    }

    fn focus_first(s: &mut DebugSession<MockTarget>, sm: u32, wp: u32) {
        s.set_focus_device(Coords::physical(0, sm, wp, 0)).unwrap();
    }

    #[test]
    fn test_single_warp_region() {
        let mut s = session(&[(0, 0)]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(3))).unwrap();
        focus_first(&mut s, 0, 0);

        assert_eq!(s.initialize_autostep(0x100).unwrap(), AutostepStatus::Continue);
        let st = s.autostep_state().unwrap();
        assert_eq!(st.end_pc, 0x160);
        assert_eq!(st.device.as_ref().unwrap().nsteps, 6);
        assert_eq!(s.autostep_phase(), AutostepPhase::SteppingWarp);

        s.step_autostep().unwrap();
        assert_eq!(s.update_autostep_state(0).unwrap(), AutostepStatus::Done);
        assert!(!s.autostep_pending());
        assert_eq!(s.autostep_phase(), AutostepPhase::Done);
        assert_eq!(s.api().calls("single_step_warp"), 1);
    }

    #[test]
    fn test_switches_to_next_warp() {
        let mut s = session(&[(0, 0), (0, 2), (1, 3)]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(2))).unwrap();
        focus_first(&mut s, 0, 0);
        let stop = AtomicBool::new(false);

        s.initialize_autostep(0x100).unwrap();
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Completed);
        assert_eq!(s.api().calls("single_step_warp"), 3);
        for (sm, wp) in [(0, 0), (0, 2), (1, 3)] {
            assert_eq!(s.api().warps[&(0, sm, wp)].pc, 0x140);
        }
        assert_eq!(s.focus_coords().and_then(|c| c.wp), Some(3));
    }

    #[test]
    fn test_skips_warps_elsewhere() {
        let mut s = session(&[(0, 0), (0, 1)]);
        s.api_mut().warp_mut(0, 0, 1).pc = 0x180;
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::instructions(2))).unwrap();
        focus_first(&mut s, 0, 0);
        let stop = AtomicBool::new(false);

        s.initialize_autostep(0x100).unwrap();
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Completed);
        assert_eq!(s.api().warps[&(0, 0, 0)].pc, 0x120);
        assert_eq!(s.api().warps[&(0, 0, 1)].pc, 0x180);
    }

    #[test]
    fn test_adjacent_region_continues_same_warp() {
        let mut s = session(&[(0, 0)]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(1))).unwrap();
        let second = s.add_breakpoint(BreakLocation::Address(0x120), Some(AutostepLength::lines(1))).unwrap();
        focus_first(&mut s, 0, 0);
        let stop = AtomicBool::new(false);

        s.initialize_autostep(0x100).unwrap();
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Completed);
        assert_eq!(s.api().warps[&(0, 0, 0)].pc, 0x140);
        let warning = format!("Overlapping autostep {} ignored", second);
        assert_eq!(s.messages().iter().filter(|m| **m == warning).count(), 1);
    }

    #[test]
    fn test_disabled_adjacent_region_is_not_entered() {
        let mut s = session(&[(0, 0), (0, 1)]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(1))).unwrap();
        let second = s.add_breakpoint(BreakLocation::Address(0x120), Some(AutostepLength::lines(1))).unwrap();
        s.disable_breakpoint(second).unwrap();
        focus_first(&mut s, 0, 0);
        let stop = AtomicBool::new(false);

        s.initialize_autostep(0x100).unwrap();
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Completed);
        assert_eq!(s.autostep_phase(), AutostepPhase::Done);
        assert_eq!(s.api().warps[&(0, 0, 0)].pc, 0x120);
        assert_eq!(s.api().warps[&(0, 0, 1)].pc, 0x120);
        assert!(s.messages().iter().all(|m| !m.starts_with("Overlapping")));
    }

    #[test]
    fn test_deleted_adjacent_region_is_not_entered() {
        let mut s = session(&[(0, 0), (0, 1)]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(1))).unwrap();
        let second = s.add_breakpoint(BreakLocation::Address(0x120), Some(AutostepLength::lines(1))).unwrap();
        s.delete_breakpoint(second).unwrap();
        focus_first(&mut s, 0, 0);
        let stop = AtomicBool::new(false);

        s.initialize_autostep(0x100).unwrap();
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Completed);
        assert_eq!(s.api().calls("single_step_warp"), 2);
        assert_eq!(s.api().warps[&(0, 0, 1)].pc, 0x120);
    }

    #[test]
    fn test_overlap_warned_once_per_run() {
        let mut s = session(&[(0, 0), (0, 1)]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(1))).unwrap();
        s.add_breakpoint(BreakLocation::Address(0x120), Some(AutostepLength::lines(1))).unwrap();
        focus_first(&mut s, 0, 0);
        let stop = AtomicBool::new(false);

        let overlaps = |s: &mut DebugSession<MockTarget>| {
            s.take_messages().iter().filter(|m| m.starts_with("Overlapping autostep")).count()
        };

        // both warps are taken through both regions, with one warning
        s.initialize_autostep(0x100).unwrap();
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Completed);
        assert_eq!(s.api().calls("single_step_warp"), 4);
        assert_eq!(s.api().warps[&(0, 0, 0)].pc, 0x140);
        assert_eq!(s.api().warps[&(0, 0, 1)].pc, 0x140);
        assert_eq!(overlaps(&mut s), 1);

        for wp in [0, 1] {
            s.api_mut().warp_mut(0, 0, wp).pc = 0x100;
        }
        s.device_invalidate(0);
        focus_first(&mut s, 0, 0);
        s.initialize_autostep(0x100).unwrap();
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Completed);
        assert_eq!(overlaps(&mut s), 1);
    }

    #[test]
    fn test_kernel_end_stops() {
        let mut s = session(&[(0, 0)]);
        s.add_breakpoint(BreakLocation::Address(0x1e0), Some(AutostepLength::instructions(10))).unwrap();
        s.api_mut().warp_mut(0, 0, 0).pc = 0x1e0;
        focus_first(&mut s, 0, 0);
        let stop = AtomicBool::new(false);

        s.initialize_autostep(0x1e0).unwrap();
        assert_eq!(s.autostep_state().unwrap().end_pc, 0x1f0);
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Completed);
        assert!(s.api().warps[&(0, 0, 0)].pc <= 0x200);
    }

    #[test]
    fn test_old_device_disables_breakpoint() {
        let mut target = MockTarget::new(vec![spec(1, 2, 32)]);
        target.specs[0].sm_type = "sm_13".into();
        target.add_warp(0, 0, 0, 7, 0x100);
        target.add_grid(grid_info(0, 7, 0x100, None), GridStatus::Active);
        let mut s = DebugSession::open(target, Box::new(program()), SessionConfig::default()).unwrap();
        let id = s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(1))).unwrap();
        focus_first(&mut s, 0, 0);

        assert_eq!(s.initialize_autostep(0x100).unwrap(), AutostepStatus::Done);
        assert!(!s.autostep_pending());
        assert!(!s.breakpoints().get(id).unwrap().enabled);
        assert_eq!(
            s.messages().last().map(String::as_str),
            Some("Disabling autostep 1 on device 0 because autostep requires compute capability 2.0 or higher.")
        );
    }

    #[test]
    fn test_disabled_breakpoint_aborts() {
        let mut s = session(&[(0, 0)]);
        let id = s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(5))).unwrap();
        focus_first(&mut s, 0, 0);
        s.initialize_autostep(0x100).unwrap();
        s.step_autostep().unwrap();
        s.disable_breakpoint(id).unwrap();
        assert_eq!(s.update_autostep_state(0).unwrap(), AutostepStatus::Done);
        assert_eq!(s.autostep_phase(), AutostepPhase::Aborted);
        assert!(!s.autostep_pending());
    }

    #[test]
    fn test_step_failure_falls_back() {
        let mut s = session(&[(0, 0)]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(2))).unwrap();
        focus_first(&mut s, 0, 0);
        s.initialize_autostep(0x100).unwrap();
        s.api_mut().fail_steps = true;
        assert_eq!(s.step_autostep().unwrap(), AutostepStatus::Fallback);
        assert!(!s.autostep_pending());
        assert_eq!(s.autostep_fallback_pc(), Some(0x140));

        s.initialize_autostep(0x100).unwrap();
        assert_eq!(s.autostep_fallback_pc(), None);
        let stop = AtomicBool::new(false);
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Fallback { resume_to: 0x140 });
        assert_eq!(s.autostep_phase(), AutostepPhase::Aborted);
    }

    #[test]
    fn test_interrupt() {
        let mut s = session(&[(0, 0)]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(2))).unwrap();
        focus_first(&mut s, 0, 0);
        s.initialize_autostep(0x100).unwrap();
        let stop = AtomicBool::new(true);
        assert_eq!(s.run_autostep(&stop).unwrap(), AutostepOutcome::Interrupted);
        assert_eq!(s.api().calls("single_step_warp"), 0);
        assert!(!s.autostep_pending());
    }

    #[test]
    fn test_exception_report() {
        let mut s = session(&[(0, 0)]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(3))).unwrap();
        focus_first(&mut s, 0, 0);
        s.initialize_autostep(0x100).unwrap();
        s.api_mut().warp_mut(0, 0, 0).exception = Some((0, ExceptionKind::IllegalAddress));
        s.step_autostep().unwrap();

        let exception = s.print_exception_if_any().unwrap().unwrap();
        // six instructions were stepped at once, so the report is approximate
        assert!(!exception.precise);
        assert_eq!(exception.pc, 0x150);
        assert_eq!(exception.line, Some(12));
        assert_eq!(exception.kind, ExceptionKind::IllegalAddress);
        assert_eq!(
            s.messages().last().map(String::as_str),
            Some("Autostep caught exception at instruction before 0x160\nThis is probably k.cu:12 (0x150)")
        );
        assert!(!s.autostep_pending());
    }

    #[test]
    fn test_host_autostep_counts_lines() {
        let mut s = session(&[]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::lines(2))).unwrap();
        s.set_focus_host(0x100);
        assert_eq!(s.initialize_autostep(0x100).unwrap(), AutostepStatus::Continue);
        assert_eq!(s.update_autostep_state(0x110).unwrap(), AutostepStatus::Continue);
        assert_eq!(s.update_autostep_state(0x120).unwrap(), AutostepStatus::Continue);
        assert_eq!(s.update_autostep_state(0x140).unwrap(), AutostepStatus::Done);
        assert!(!s.autostep_pending());
    }

    #[test]
    fn test_host_instruction_mode_and_overlap() {
        let mut s = session(&[]);
        s.add_breakpoint(BreakLocation::Address(0x100), Some(AutostepLength::instructions(3))).unwrap();
        s.add_breakpoint(BreakLocation::Address(0x110), Some(AutostepLength::instructions(1))).unwrap();
        s.set_focus_host(0x100);
        s.initialize_autostep(0x100).unwrap();
        assert_eq!(s.update_autostep_state(0x110).unwrap(), AutostepStatus::Continue);
        assert_eq!(s.messages(), ["Overlapping autostep 2 ignored"]);
        assert_eq!(s.update_autostep_state(0x110).unwrap(), AutostepStatus::Continue);
        assert_eq!(s.update_autostep_state(0x120).unwrap(), AutostepStatus::Continue);
        assert_eq!(s.update_autostep_state(0x130).unwrap(), AutostepStatus::Done);

        s.initialize_autostep(0x100).unwrap();
        let exception = s.report_host_exception().unwrap();
        assert!(exception.precise);
        assert_eq!(exception.line, Some(10));
    }
}
