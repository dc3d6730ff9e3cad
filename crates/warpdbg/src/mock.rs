//! Counting in-memory target for unit tests.

use crate::error::TargetError;
use crate::mask::{LaneMask, SmMask, WarpMask};
use crate::target::DebugTarget;
use crate::types::{
    DeviceSpec, Dim3, Event, ExceptionKind, GridId, GridInfo, GridStatus, KernelOrigin,
    KernelType, LaneSnapshot, WarpSnapshot,
};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

pub(crate) fn spec(num_sms: u32, num_warps: u32, num_lanes: u32) -> DeviceSpec {
    DeviceSpec {
        num_sms,
        num_warps,
        num_lanes,
        num_registers: 64,
        num_predicates: 7,
        device_type: "mock".to_string(),
        sm_type: "sm_75".to_string(),
        inst_size: 16,
    }
}

pub(crate) fn grid_info(dev: u32, grid_id: GridId, entry: u64, parent: Option<GridId>) -> GridInfo {
    GridInfo {
        dev,
        grid_id,
        function_entry: entry,
        context: 1,
        module: 1,
        grid_dim: Dim3::new(1, 1, 1),
        block_dim: Dim3::new(32, 1, 1),
        kernel_type: KernelType::Application,
        origin: if parent.is_some() { KernelOrigin::Device } else { KernelOrigin::Host },
        parent_grid_id: parent,
        args: None,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockWarp {
    pub grid_id: GridId,
    pub block_idx: Dim3,
    pub valid: LaneMask,
    pub active: LaneMask,
    pub pc: u64,
    pub call_depth: u32,
    pub broken: bool,
    pub exception: Option<(u32, ExceptionKind)>,
}

#[derive(Debug, Default)]
pub(crate) struct MockTarget {
    pub specs: Vec<DeviceSpec>,
    pub warps: HashMap<(u32, u32, u32), MockWarp>,
    pub grids: HashMap<(u32, GridId), (GridInfo, GridStatus)>,
    pub registers: HashMap<(u32, u32, u32, u32, u32), u32>,
    pub predicates: HashMap<(u32, u32, u32, u32), Vec<bool>>,
    pub events: VecDeque<Event>,
    /// Warps reported as stepped in addition to the requested one
    pub extra_stepped: WarpMask,
    pub fail_steps: bool,
    pub suspended: Vec<bool>,
    calls: RefCell<HashMap<&'static str, u32>>,
}

impl MockTarget {
    pub fn new(specs: Vec<DeviceSpec>) -> Self {
        let suspended = vec![true; specs.len()];
        Self { specs, suspended, ..Self::default() }
    }

    pub fn add_warp(&mut self, dev: u32, sm: u32, wp: u32, grid_id: GridId, pc: u64) {
        let lanes = self.specs[dev as usize].num_lanes;
        self.warps.insert(
            (dev, sm, wp),
            MockWarp {
                grid_id,
                block_idx: Dim3::new(wp, sm, 0),
                valid: LaneMask::first_n(lanes),
                active: LaneMask::first_n(lanes),
                pc,
                call_depth: 0,
                broken: true,
                exception: None,
            },
        );
    }

    pub fn add_grid(&mut self, info: GridInfo, status: GridStatus) {
        self.grids.insert((info.dev, info.grid_id), (info, status));
    }

    pub fn warp_mut(&mut self, dev: u32, sm: u32, wp: u32) -> &mut MockWarp {
        self.warps.get_mut(&(dev, sm, wp)).expect("no such mock warp")
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

    fn warp(&self, dev: u32, sm: u32, wp: u32) -> Result<&MockWarp, TargetError> {
        self.warps.get(&(dev, sm, wp)).ok_or_else(|| TargetError::CallFailed {
            call: "warp",
            reason: format!("no warp {} {} {}", dev, sm, wp),
        })
    }
}

impl DebugTarget for MockTarget {
    fn device_count(&self) -> Result<u32, TargetError> {
        self.count("device_count");
        Ok(self.specs.len() as u32)
    }

    fn device_spec(&self, dev: u32) -> Result<DeviceSpec, TargetError> {
        self.count("device_spec");
        self.specs.get(dev as usize).cloned().ok_or(TargetError::Detached)
    }

    fn read_device_exception_state(&self, dev: u32) -> Result<SmMask, TargetError> {
        self.count("read_device_exception_state");
        Ok(self
            .warps
            .iter()
            .filter(|((d, _, _), w)| *d == dev && w.exception.is_some())
            .map(|((_, sm, _), _)| *sm)
            .collect())
    }

    fn read_valid_warps(&self, dev: u32, sm: u32) -> Result<WarpMask, TargetError> {
        self.count("read_valid_warps");
        Ok(self
            .warps
            .keys()
            .filter(|(d, s, _)| *d == dev && *s == sm)
            .map(|(_, _, wp)| *wp)
            .collect())
    }

    fn read_broken_warps(&self, dev: u32, sm: u32) -> Result<WarpMask, TargetError> {
        self.count("read_broken_warps");
        Ok(self
            .warps
            .iter()
            .filter(|((d, s, _), w)| *d == dev && *s == sm && w.broken)
            .map(|((_, _, wp), _)| *wp)
            .collect())
    }

    fn read_warp_state(&self, dev: u32, sm: u32, wp: u32) -> Result<WarpSnapshot, TargetError> {
        self.count("read_warp_state");
        let w = self.warp(dev, sm, wp)?;
        let lanes = (0..self.specs[dev as usize].num_lanes)
            .map(|ln| LaneSnapshot {
                thread_idx: Dim3::new(ln, 0, 0),
                virtual_pc: w.pc,
                exception: match w.exception {
                    Some((l, kind)) if l == ln => kind,
                    _ => ExceptionKind::None,
                },
            })
            .collect();
        Ok(WarpSnapshot {
            grid_id: w.grid_id,
            block_idx: w.block_idx,
            valid_lanes: w.valid,
            active_lanes: w.active,
            error_pc: w.exception.map(|_| w.pc),
            lanes,
        })
    }

    fn read_pc(&self, dev: u32, sm: u32, wp: u32, _ln: u32) -> Result<u64, TargetError> {
        self.count("read_pc");
        Ok(self.warp(dev, sm, wp)?.pc)
    }

    fn read_register(&self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32)
        -> Result<u32, TargetError> {
        self.count("read_register");
        Ok(self.registers.get(&(dev, sm, wp, ln, regno)).copied().unwrap_or(regno))
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
        Ok((first..first + count)
            .map(|r| self.registers.get(&(dev, sm, wp, ln, r)).copied().unwrap_or(r))
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
        self.registers.insert((dev, sm, wp, ln, regno), value);
        Ok(())
    }

    fn read_predicates(&self, dev: u32, sm: u32, wp: u32, ln: u32, count: u32)
        -> Result<Vec<bool>, TargetError> {
        self.count("read_predicates");
        let mut preds = self
            .predicates
            .get(&(dev, sm, wp, ln))
            .cloned()
            .unwrap_or_default();
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
        self.predicates.insert((dev, sm, wp, ln), values.to_vec());
        Ok(())
    }

    fn read_call_depth(&self, dev: u32, sm: u32, wp: u32, _ln: u32) -> Result<u32, TargetError> {
        self.count("read_call_depth");
        Ok(self.warp(dev, sm, wp)?.call_depth)
    }

    fn previous_address(&self, _dev: u32, addr: u64) -> Result<u64, TargetError> {
        self.count("previous_address");
        Ok(addr.saturating_sub(16))
    }

    fn single_step_warp(&mut self, dev: u32, sm: u32, wp: u32, nsteps: u32)
        -> Result<WarpMask, TargetError> {
        self.count("single_step_warp");
        if self.fail_steps {
            return Err(TargetError::ExecutionRefused { dev, sm });
        }
        let w = self.warps.get_mut(&(dev, sm, wp)).ok_or(TargetError::Detached)?;
        w.pc += 16 * nsteps as u64;
        let mut mask = self.extra_stepped;
        mask.set(wp);
        Ok(mask)
    }

    fn resume_warps_until_pc(&mut self, dev: u32, sm: u32, mask: WarpMask, pc: u64)
        -> Result<(), TargetError> {
        self.count("resume_warps_until_pc");
        for wp in mask.iter() {
            if let Some(w) = self.warps.get_mut(&(dev, sm, wp)) {
                w.pc = pc;
            }
        }
        Ok(())
    }

    fn resume_device(&mut self, dev: u32) -> Result<(), TargetError> {
        self.count("resume_device");
        self.suspended[dev as usize] = false;
        Ok(())
    }

    fn suspend_device(&mut self, dev: u32) -> Result<(), TargetError> {
        self.count("suspend_device");
        self.suspended[dev as usize] = true;
        Ok(())
    }

    fn grid_info(&self, dev: u32, grid_id: GridId) -> Result<GridInfo, TargetError> {
        self.count("grid_info");
        self.grids
            .get(&(dev, grid_id))
            .map(|(info, _)| info.clone())
            .ok_or_else(|| TargetError::CallFailed {
                call: "grid_info",
                reason: format!("no grid {}", grid_id),
            })
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
