//! Software model of an accelerator
//!
//! [`SimTarget`] implements [`DebugTarget`] over a described machine: devices
//! with resident warps, the grids they belong to, and a program whose
//! instruction flags decide what a step does. Lanes of a warp run in
//! lockstep at the lowest PC among them; lanes ahead of it wait, which gives
//! divergence and reconvergence without modelling a branch stack.
//!
//! Every trait call is counted so tests can check how many round trips the
//! state cache made.

use common::{create_logger, Logger};
use debuginfo::{DebugInfo, Instruction, InstructionFlags};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use warpdbg::{
    DebugTarget, DeviceSpec, Dim3, Event, ExceptionKind, GridId, GridInfo, GridStatus, LaneMask,
    LaneSnapshot, SmMask, TargetError, WarpMask, WarpSnapshot,
};

/// Instructions a resumed warp may execute before the run is cut short
const RUN_LIMIT: u32 = 100_000;

#[derive(Debug, Clone, Default)]
pub struct SimLane {
    pub thread_idx: Dim3,
    pub pc: u64,
    /// Cleared when the thread exits
    pub valid: bool,
    pub exception: ExceptionKind,
    pub registers: HashMap<u32, u32>,
    pub predicates: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct SimWarp {
    pub grid_id: GridId,
    pub block_idx: Dim3,
    pub lanes: Vec<SimLane>,
    /// Return addresses of calls in progress
    pub returns: Vec<u64>,
    /// Lanes that take conditional branches
    pub branch_mask: LaneMask,
    /// Address of the instruction that raised an exception
    pub error_pc: Option<u64>,
}

impl SimWarp {
    /// Lowest PC among the live lanes; the PC the warp executes next.
    pub fn pc(&self) -> Option<u64> {
        self.lanes.iter().filter(|l| l.valid).map(|l| l.pc).min()
    }

    pub fn valid_mask(&self) -> LaneMask {
        self.lanes
            .iter()
            .enumerate()
            .filter(|(_, l)| l.valid)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn active_mask(&self) -> LaneMask {
        let Some(pc) = self.pc() else {
            return LaneMask::empty();
        };
        self.lanes
            .iter()
            .enumerate()
            .filter(|(_, l)| l.valid && l.pc == pc)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn is_resident(&self) -> bool {
        self.lanes.iter().any(|l| l.valid)
    }

    fn stopped(&self) -> bool {
        self.error_pc.is_some() || !self.is_resident()
    }
}

#[derive(Debug, Clone)]
struct SimDevice {
    spec: DeviceSpec,
    warps: BTreeMap<(u32, u32), SimWarp>,
}

/// Exception raised by a trap instruction, named after its text
fn trap_kind(text: &str) -> ExceptionKind {
    let lower = text.to_ascii_lowercase();
    if lower.contains("misaligned") {
        ExceptionKind::MisalignedAddress
    } else if lower.contains("range") {
        ExceptionKind::OutOfRangeAddress
    } else if lower.contains("instruction") {
        ExceptionKind::IllegalInstruction
    } else if lower.contains("stack") {
        ExceptionKind::StackOverflow
    } else if lower.contains("assert") {
        ExceptionKind::Assert
    } else {
        ExceptionKind::IllegalAddress
    }
}

fn no_such(call: &'static str, what: String) -> TargetError {
    TargetError::CallFailed { call, reason: what }
}

/// Simulated debug target.
pub struct SimTarget {
    devices: Vec<SimDevice>,
    grids: BTreeMap<(u32, GridId), (GridInfo, GridStatus)>,
    program: DebugInfo,
    breakpoints: BTreeSet<u64>,
    events: VecDeque<Event>,
    suspended: Vec<bool>,
    fail_steps: bool,
    calls: RefCell<BTreeMap<&'static str, u32>>,
    log: Logger,
}

impl SimTarget {
    pub fn new(program: DebugInfo) -> Self {
        Self {
            devices: Vec::new(),
            grids: BTreeMap::new(),
            program,
            breakpoints: BTreeSet::new(),
            events: VecDeque::new(),
            suspended: Vec::new(),
            fail_steps: false,
            calls: RefCell::new(BTreeMap::new()),
            log: create_logger("sim"),
        }
    }

    pub fn program(&self) -> &DebugInfo {
        &self.program
    }

    /// Replace the loaded code. Instructions must be sorted by address.
    pub fn load_program(&mut self, program: DebugInfo) {
        self.program = program;
    }

    /// Add a device, returning its index.
    pub fn add_device(&mut self, spec: DeviceSpec) -> u32 {
        self.devices.push(SimDevice { spec, warps: BTreeMap::new() });
        self.suspended.push(false);
        self.devices.len() as u32 - 1
    }

    /// Register a grid and queue its launch notification.
    pub fn launch_grid(&mut self, info: GridInfo, status: GridStatus) {
        let key = (info.dev, info.grid_id);
        common::log!(self.log, "launch grid {} on device {}", info.grid_id, info.dev);
        self.grids.insert(key, (info, status));
        self.events.push_back(Event::GridLaunch { dev: key.0, grid_id: key.1 });
    }

    pub fn set_grid_status(&mut self, dev: u32, grid_id: GridId, status: GridStatus) {
        if let Some((_, s)) = self.grids.get_mut(&(dev, grid_id)) {
            *s = status;
        }
    }

    /// Place a warp of `num_lanes` threads on an SM. Thread x indices start
    /// at `first_thread`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_warp(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        grid_id: GridId,
        block_idx: Dim3,
        pc: u64,
        num_lanes: u32,
        first_thread: u32,
    ) -> Result<(), TargetError> {
        let device = self
            .devices
            .get_mut(dev as usize)
            .ok_or_else(|| no_such("add_warp", format!("no device {}", dev)))?;
        let spec = &device.spec;
        if sm >= spec.num_sms || wp >= spec.num_warps || num_lanes > spec.num_lanes {
            return Err(no_such("add_warp", format!("warp {}/{}/{} does not fit the device", dev, sm, wp)));
        }
        let lanes = (0..spec.num_lanes)
            .map(|ln| SimLane {
                thread_idx: Dim3::new(first_thread + ln, 0, 0),
                pc,
                valid: ln < num_lanes,
                ..SimLane::default()
            })
            .collect();
        device.warps.insert(
            (sm, wp),
            SimWarp {
                grid_id,
                block_idx,
                lanes,
                returns: Vec::new(),
                branch_mask: LaneMask::first_n(spec.num_lanes),
                error_pc: None,
            },
        );
        Ok(())
    }

    pub fn warp(&self, dev: u32, sm: u32, wp: u32) -> Option<&SimWarp> {
        self.devices.get(dev as usize)?.warps.get(&(sm, wp))
    }

    pub fn warp_mut(&mut self, dev: u32, sm: u32, wp: u32) -> Option<&mut SimWarp> {
        self.devices.get_mut(dev as usize)?.warps.get_mut(&(sm, wp))
    }

    /// Stop warps that reach `addr` while running.
    pub fn set_breakpoint(&mut self, addr: u64) {
        self.breakpoints.insert(addr);
    }

    pub fn clear_breakpoint(&mut self, addr: u64) {
        self.breakpoints.remove(&addr);
    }

    /// Make every step request fail.
    pub fn set_fail_steps(&mut self, fail: bool) {
        self.fail_steps = fail;
    }

    pub fn is_suspended(&self, dev: u32) -> bool {
        self.suspended.get(dev as usize).copied().unwrap_or(false)
    }

    pub fn calls(&self, name: &str) -> u32 {
        self.calls.borrow().get(name).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.borrow().values().sum()
    }

    pub fn reset_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    fn count(&self, name: &'static str) {
        *self.calls.borrow_mut().entry(name).or_default() += 1;
    }

    fn device(&self, dev: u32) -> Result<&SimDevice, TargetError> {
        self.devices
            .get(dev as usize)
            .ok_or_else(|| no_such("device", format!("no device {}", dev)))
    }

    fn resident(&self, dev: u32, sm: u32, wp: u32) -> Result<&SimWarp, TargetError> {
        self.warp(dev, sm, wp)
            .filter(|w| w.is_resident())
            .ok_or_else(|| no_such("warp", format!("no warp {}/{}/{}", dev, sm, wp)))
    }

    fn lane(&self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<&SimLane, TargetError> {
        self.resident(dev, sm, wp)?
            .lanes
            .get(ln as usize)
            .ok_or_else(|| no_such("lane", format!("no lane {}/{}/{}/{}", dev, sm, wp, ln)))
    }

    fn lane_mut(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<&mut SimLane, TargetError> {
        self.warp_mut(dev, sm, wp)
            .and_then(|w| w.lanes.get_mut(ln as usize))
            .ok_or_else(|| no_such("lane", format!("no lane {}/{}/{}/{}", dev, sm, wp, ln)))
    }

    fn instruction(&self, pc: u64) -> Option<&Instruction> {
        let insns = &self.program.instructions;
        insns
            .binary_search_by_key(&pc, |i| i.address)
            .ok()
            .map(|idx| &insns[idx])
    }

    /// Execute the instruction at the warp's PC for its active lanes.
    fn execute(&mut self, dev: u32, sm: u32, wp: u32) {
        let Some(pc) = self.warp(dev, sm, wp).and_then(SimWarp::pc) else {
            return;
        };
        let insn = self.instruction(pc).cloned();
        let Some(warp) = self.warp_mut(dev, sm, wp) else {
            return;
        };
        let active = warp.active_mask();

        let Some(insn) = insn else {
            // ran off the known code
            for ln in active.iter() {
                warp.lanes[ln as usize].valid = false;
            }
            return;
        };
        let next = insn.next_address();
        let flags = insn.flags;

        if flags.contains(InstructionFlags::TRAP) {
            let kind = trap_kind(&insn.text);
            for ln in active.iter() {
                let lane = &mut warp.lanes[ln as usize];
                lane.exception = kind;
                lane.pc = next;
            }
            warp.error_pc = Some(pc);
        } else if flags.contains(InstructionFlags::EXIT) {
            for ln in active.iter() {
                warp.lanes[ln as usize].valid = false;
            }
        } else if flags.contains(InstructionFlags::CALL) {
            let target = insn.target.unwrap_or(next);
            warp.returns.push(next);
            for ln in active.iter() {
                warp.lanes[ln as usize].pc = target;
            }
        } else if flags.contains(InstructionFlags::RETURN) {
            match warp.returns.pop() {
                Some(ret) => {
                    for ln in active.iter() {
                        warp.lanes[ln as usize].pc = ret;
                    }
                }
                None => {
                    for ln in active.iter() {
                        warp.lanes[ln as usize].valid = false;
                    }
                }
            }
        } else if flags.contains(InstructionFlags::BRANCH) {
            let target = insn.target.unwrap_or(next);
            let taken = warp.branch_mask;
            for ln in active.iter() {
                warp.lanes[ln as usize].pc = if taken.contains(ln) { target } else { next };
            }
        } else {
            for ln in active.iter() {
                warp.lanes[ln as usize].pc = next;
            }
        }

        if !warp.is_resident() {
            let grid_id = warp.grid_id;
            common::log!(self.log, "warp {}/{}/{} exited", dev, sm, wp);
            self.retire_warp(dev, sm, wp, grid_id);
        }
    }

    /// Remove an exited warp; the grid terminates with its last warp.
    fn retire_warp(&mut self, dev: u32, sm: u32, wp: u32, grid_id: GridId) {
        if let Some(device) = self.devices.get_mut(dev as usize) {
            device.warps.remove(&(sm, wp));
            let remaining = device.warps.values().any(|w| w.grid_id == grid_id);
            if !remaining {
                self.set_grid_status(dev, grid_id, GridStatus::Terminated);
                self.events.push_back(Event::GridTerminated { dev, grid_id });
            }
        }
    }

    fn warp_keys(&self, dev: u32) -> Vec<(u32, u32)> {
        self.devices
            .get(dev as usize)
            .map(|d| d.warps.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Run a warp until it reaches a breakpoint, `until`, an exception or its end.
    fn run_warp(&mut self, dev: u32, sm: u32, wp: u32, until: Option<u64>) {
        for _ in 0..RUN_LIMIT {
            match self.warp(dev, sm, wp) {
                Some(w) if !w.stopped() => {}
                _ => return,
            }
            self.execute(dev, sm, wp);
            let Some(pc) = self.warp(dev, sm, wp).and_then(SimWarp::pc) else {
                return;
            };
            if until == Some(pc) || self.breakpoints.contains(&pc) {
                return;
            }
        }
    }
}

impl DebugTarget for SimTarget {
    fn device_count(&self) -> Result<u32, TargetError> {
        self.count("device_count");
        Ok(self.devices.len() as u32)
    }

    fn device_spec(&self, dev: u32) -> Result<DeviceSpec, TargetError> {
        self.count("device_spec");
        Ok(self.device(dev)?.spec.clone())
    }

    fn read_device_exception_state(&self, dev: u32) -> Result<SmMask, TargetError> {
        self.count("read_device_exception_state");
        Ok(self
            .device(dev)?
            .warps
            .iter()
            .filter(|(_, w)| w.error_pc.is_some())
            .map(|(&(sm, _), _)| sm)
            .collect())
    }

    fn read_valid_warps(&self, dev: u32, sm: u32) -> Result<WarpMask, TargetError> {
        self.count("read_valid_warps");
        Ok(self
            .device(dev)?
            .warps
            .iter()
            .filter(|(&(s, _), w)| s == sm && w.is_resident())
            .map(|(&(_, wp), _)| wp)
            .collect())
    }

    fn read_broken_warps(&self, dev: u32, sm: u32) -> Result<WarpMask, TargetError> {
        self.count("read_broken_warps");
        Ok(self
            .device(dev)?
            .warps
            .iter()
            .filter(|(&(s, _), w)| s == sm && w.pc().is_some_and(|pc| self.breakpoints.contains(&pc)))
            .map(|(&(_, wp), _)| wp)
            .collect())
    }

    fn read_warp_state(&self, dev: u32, sm: u32, wp: u32) -> Result<WarpSnapshot, TargetError> {
        self.count("read_warp_state");
        let w = self.resident(dev, sm, wp)?;
        Ok(WarpSnapshot {
            grid_id: w.grid_id,
            block_idx: w.block_idx,
            valid_lanes: w.valid_mask(),
            active_lanes: w.active_mask(),
            error_pc: w.error_pc,
            lanes: w
                .lanes
                .iter()
                .map(|l| LaneSnapshot {
                    thread_idx: l.thread_idx,
                    virtual_pc: l.pc,
                    exception: l.exception,
                })
                .collect(),
        })
    }

    fn read_pc(&self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64, TargetError> {
        self.count("read_pc");
        Ok(self.lane(dev, sm, wp, ln)?.pc)
    }

    fn read_register(&self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32)
        -> Result<u32, TargetError> {
        self.count("read_register");
        Ok(self.lane(dev, sm, wp, ln)?.registers.get(&regno).copied().unwrap_or(0))
    }

    fn read_register_range(
        &self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        first: u32,
        count: u32,
    ) -> Result<Vec<u32>, TargetError> {
        self.count("read_register_range");
        let lane = self.lane(dev, sm, wp, ln)?;
        Ok((first..first + count)
            .map(|r| lane.registers.get(&r).copied().unwrap_or(0))
            .collect())
    }

    fn write_register(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        regno: u32,
        value: u32,
    ) -> Result<(), TargetError> {
        self.count("write_register");
        self.lane_mut(dev, sm, wp, ln)?.registers.insert(regno, value);
        Ok(())
    }

    fn read_predicates(&self, dev: u32, sm: u32, wp: u32, ln: u32, count: u32)
        -> Result<Vec<bool>, TargetError> {
        self.count("read_predicates");
        let mut preds = self.lane(dev, sm, wp, ln)?.predicates.clone();
        preds.resize(count as usize, false);
        Ok(preds)
    }

    fn write_predicates(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        values: &[bool],
    ) -> Result<(), TargetError> {
        self.count("write_predicates");
        self.lane_mut(dev, sm, wp, ln)?.predicates = values.to_vec();
        Ok(())
    }

    fn read_call_depth(&self, dev: u32, sm: u32, wp: u32, _ln: u32) -> Result<u32, TargetError> {
        self.count("read_call_depth");
        Ok(self.resident(dev, sm, wp)?.returns.len() as u32)
    }

    fn previous_address(&self, dev: u32, addr: u64) -> Result<u64, TargetError> {
        self.count("previous_address");
        let insns = &self.program.instructions;
        let idx = insns.partition_point(|i| i.address < addr);
        match idx.checked_sub(1).map(|i| &insns[i]) {
            Some(insn) => Ok(insn.address),
            None => Ok(addr.saturating_sub(self.device(dev)?.spec.inst_size as u64)),
        }
    }

    fn single_step_warp(&mut self, dev: u32, sm: u32, wp: u32, nsteps: u32)
        -> Result<WarpMask, TargetError> {
        self.count("single_step_warp");
        if self.fail_steps {
            return Err(TargetError::ExecutionRefused { dev, sm });
        }
        self.resident(dev, sm, wp)?;
        common::log!(self.log, "step warp {}/{}/{} x{}", dev, sm, wp, nsteps);
        for _ in 0..nsteps {
            match self.warp(dev, sm, wp) {
                Some(w) if !w.stopped() => self.execute(dev, sm, wp),
                _ => break,
            }
        }
        let mut stepped = WarpMask::empty();
        stepped.set(wp);
        Ok(stepped)
    }

    fn resume_warps_until_pc(&mut self, dev: u32, sm: u32, mask: WarpMask, pc: u64)
        -> Result<(), TargetError> {
        self.count("resume_warps_until_pc");
        if self.fail_steps {
            return Err(TargetError::ExecutionRefused { dev, sm });
        }
        for wp in mask.iter() {
            self.run_warp(dev, sm, wp, Some(pc));
        }
        Ok(())
    }

    fn resume_device(&mut self, dev: u32) -> Result<(), TargetError> {
        self.count("resume_device");
        self.device(dev)?;
        self.suspended[dev as usize] = false;
        for (sm, wp) in self.warp_keys(dev) {
            self.run_warp(dev, sm, wp, None);
        }
        let faulted = self
            .devices
            .get(dev as usize)
            .is_some_and(|d| d.warps.values().any(|w| w.error_pc.is_some()));
        if faulted {
            self.events.push_back(Event::DeviceException { dev });
        }
        Ok(())
    }

    fn suspend_device(&mut self, dev: u32) -> Result<(), TargetError> {
        self.count("suspend_device");
        self.device(dev)?;
        self.suspended[dev as usize] = true;
        Ok(())
    }

    fn grid_info(&self, dev: u32, grid_id: GridId) -> Result<GridInfo, TargetError> {
        self.count("grid_info");
        self.grids
            .get(&(dev, grid_id))
            .map(|(info, _)| info.clone())
            .ok_or_else(|| no_such("grid_info", format!("no grid {} on device {}", grid_id, dev)))
    }

    fn grid_status(&self, dev: u32, grid_id: GridId) -> Result<GridStatus, TargetError> {
        self.count("grid_status");
        Ok(self
            .grids
            .get(&(dev, grid_id))
            .map(|(_, status)| *status)
            .unwrap_or(GridStatus::Invalid))
    }

    fn next_event(&mut self) -> Result<Option<Event>, TargetError> {
        self.count("next_event");
        Ok(self.events.pop_front())
    }
}
