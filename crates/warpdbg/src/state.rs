//! Hierarchical state cache
//!
//! Mirrors the live execution state of the accelerator as a tree
//! System -> Device -> SM -> Warp -> Lane. Every field is a [`Cached`] cell
//! filled from the target on first use and trusted until invalidated.
//! Invalidation only travels downwards: dropping a device drops its SMs,
//! warps and lanes, dropping a warp drops only its lanes.
//!
//! Lane state that the target reports per warp (thread index, virtual PC,
//! exception) is fetched with a single `read_warp_state` call and fanned out
//! to every lane cell, so a stop costs one round trip per warp rather than
//! one per lane.
//!
//! Reading a warp or lane field for a warp or lane that is not valid is a
//! contract violation and panics; callers check `warp_is_valid` /
//! `lane_is_valid` first.

use crate::cached::Cached;
use crate::config::{CACHED_REGISTERS, MAX_DEVICES, MAX_LANES, MAX_SMS, MAX_WARPS, REGISTER_BATCH};
use crate::coords::Coords;
use crate::error::{DebugError, Result};
use crate::iterator::{CoordIterator, SelectFlags};
use crate::mask::{DeviceMask, LaneMask, SmMask, WarpMask};
use crate::session::DebugSession;
use crate::target::DebugTarget;
use crate::types::{DeviceSpec, Dim3, ExceptionKind, GridId, KernelId, WarpSnapshot};

/// Predicate register that always reads as true.
const PREDICATE_TRUE: u32 = 7;

#[derive(Debug, Default)]
pub(crate) struct LaneCache {
    pc: Cached<u64>,
    virtual_pc: Cached<u64>,
    thread_idx: Cached<Dim3>,
    exception: Cached<ExceptionKind>,
    timestamp: Cached<u64>,
    registers: Vec<Option<u32>>,
    predicates: Cached<Vec<bool>>,
}

impl LaneCache {
    fn invalidate(&mut self) {
        self.pc.invalidate();
        self.virtual_pc.invalidate();
        self.thread_idx.invalidate();
        self.exception.invalidate();
        self.timestamp.invalidate();
        self.registers.clear();
        self.predicates.invalidate();
    }
}

#[derive(Debug, Default)]
pub(crate) struct WarpCache {
    valid_lanes: Cached<LaneMask>,
    active_lanes: Cached<LaneMask>,
    grid_id: Cached<GridId>,
    block_idx: Cached<Dim3>,
    kernel: Cached<KernelId>,
    error_pc: Cached<Option<u64>>,
    timestamp: Cached<u64>,
    lanes: Vec<LaneCache>,
}

impl WarpCache {
    fn new(num_lanes: u32) -> Self {
        Self {
            lanes: (0..num_lanes).map(|_| LaneCache::default()).collect(),
            ..Self::default()
        }
    }

    fn invalidate(&mut self) {
        self.valid_lanes.invalidate();
        self.active_lanes.invalidate();
        self.grid_id.invalidate();
        self.block_idx.invalidate();
        self.kernel.invalidate();
        self.error_pc.invalidate();
        self.timestamp.invalidate();
        for lane in &mut self.lanes {
            lane.invalidate();
        }
    }

    fn fill(&mut self, snap: WarpSnapshot, sm_has_exception: bool, clock: u64) {
        let valid = snap.valid_lanes;
        self.grid_id.set_if_empty(snap.grid_id, clock);
        self.block_idx.set_if_empty(snap.block_idx, clock);
        self.valid_lanes.set_if_empty(valid, clock);
        self.active_lanes.set_if_empty(snap.active_lanes, clock);
        self.error_pc.set_if_empty(snap.error_pc, clock);

        for (ln, (lane, ls)) in self.lanes.iter_mut().zip(snap.lanes).enumerate() {
            if !valid.contains(ln as u32) {
                continue;
            }
            lane.thread_idx.set_if_empty(ls.thread_idx, clock);
            lane.virtual_pc.set_if_empty(ls.virtual_pc, clock);
            let exception = if sm_has_exception { ls.exception } else { ExceptionKind::None };
            lane.exception.set_if_empty(exception, clock);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SmCache {
    valid_warps: Cached<WarpMask>,
    broken_warps: Cached<WarpMask>,
    warps: Vec<WarpCache>,
}

impl SmCache {
    fn invalidate_masks(&mut self) {
        self.valid_warps.invalidate();
        self.broken_warps.invalidate();
    }

    fn invalidate(&mut self) {
        self.invalidate_masks();
        for warp in &mut self.warps {
            warp.invalidate();
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DeviceCache {
    /// Static, never invalidated
    spec: Option<DeviceSpec>,
    valid: Cached<bool>,
    exception_sms: Cached<SmMask>,
    sms: Vec<SmCache>,
}

impl DeviceCache {
    fn install_spec(&mut self, dev: u32, spec: DeviceSpec) {
        assert!(spec.num_sms <= MAX_SMS, "device {} has {} SMs, at most {} supported", dev, spec.num_sms, MAX_SMS);
        assert!(spec.num_warps <= MAX_WARPS, "device {} has {} warps per SM, at most {} supported", dev, spec.num_warps, MAX_WARPS);
        assert!(spec.num_lanes <= MAX_LANES, "device {} has {} lanes per warp, at most {} supported", dev, spec.num_lanes, MAX_LANES);

        if self.sms.is_empty() {
            self.sms = (0..spec.num_sms)
                .map(|_| SmCache {
                    warps: (0..spec.num_warps).map(|_| WarpCache::new(spec.num_lanes)).collect(),
                    ..SmCache::default()
                })
                .collect();
        }
        self.spec = Some(spec);
    }

    fn invalidate(&mut self) {
        self.valid.invalidate();
        self.exception_sms.invalidate();
        for sm in &mut self.sms {
            sm.invalidate();
        }
    }
}

/// Root of the cache tree, sized once when the session opens.
#[derive(Debug)]
pub(crate) struct SystemState {
    devices: Vec<DeviceCache>,
    suspended: DeviceMask,
}

impl SystemState {
    pub(crate) fn new(num_devices: u32, max_devices: u32) -> Self {
        let max = max_devices.min(MAX_DEVICES);
        assert!(num_devices <= max, "{} devices present, at most {} supported", num_devices, max);
        Self {
            devices: (0..num_devices).map(|_| DeviceCache::default()).collect(),
            suspended: DeviceMask::empty(),
        }
    }

    pub(crate) fn num_devices(&self) -> u32 {
        self.devices.len() as u32
    }

    /// Whether the device's SM/warp/lane nodes exist yet.
    fn is_populated(&self, dev: u32) -> bool {
        !self.device(dev).sms.is_empty()
    }

    fn device(&self, dev: u32) -> &DeviceCache {
        assert!(dev < self.num_devices(), "device {} out of range", dev);
        &self.devices[dev as usize]
    }

    fn device_mut(&mut self, dev: u32) -> &mut DeviceCache {
        assert!(dev < self.num_devices(), "device {} out of range", dev);
        &mut self.devices[dev as usize]
    }

    fn sm_mut(&mut self, dev: u32, sm: u32) -> &mut SmCache {
        let device = self.device_mut(dev);
        assert!((sm as usize) < device.sms.len(), "sm {} out of range on device {}", sm, dev);
        &mut device.sms[sm as usize]
    }

    fn warp_mut(&mut self, dev: u32, sm: u32, wp: u32) -> &mut WarpCache {
        let sm_cache = self.sm_mut(dev, sm);
        assert!((wp as usize) < sm_cache.warps.len(), "warp {} out of range on sm {}", wp, sm);
        &mut sm_cache.warps[wp as usize]
    }

    fn lane_mut(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> &mut LaneCache {
        let warp = self.warp_mut(dev, sm, wp);
        assert!((ln as usize) < warp.lanes.len(), "lane {} out of range on warp {}", ln, wp);
        &mut warp.lanes[ln as usize]
    }

    pub(crate) fn invalidate_all(&mut self) {
        for device in &mut self.devices {
            device.invalidate();
        }
    }
}

fn stale(what: &str, dev: u32, sm: u32, wp: u32, ln: Option<u32>) -> DebugError {
    let mut coords = Coords::wildcard().with_dev(dev).with_sm(sm).with_warp(wp);
    if let Some(ln) = ln {
        coords = coords.with_lane(ln);
    }
    DebugError::InvalidCoordinates(format!("{} unavailable at {}", what, coords))
}

// ============================================================================
// Device
// ============================================================================

impl<A: DebugTarget> DebugSession<A> {
    pub fn device_count(&self) -> u32 {
        self.state.num_devices()
    }

    /// Static description of a device, fetched once per session.
    pub fn device_spec(&mut self, dev: u32) -> Result<&DeviceSpec> {
        if self.state.device(dev).spec.is_none() {
            let spec = self.api.device_spec(dev)?;
            common::log!(self.logs.state, "device {}: {} SMs x {} warps x {} lanes ({})",
                dev, spec.num_sms, spec.num_warps, spec.num_lanes, spec.sm_type);
            self.state.device_mut(dev).install_spec(dev, spec);
        }
        self.state
            .device(dev)
            .spec
            .as_ref()
            .ok_or_else(|| DebugError::InvalidCoordinates(format!("device {}", dev)))
    }

    /// Seed the static description of a device without asking the target.
    pub fn set_device_spec(&mut self, dev: u32, spec: DeviceSpec) {
        self.state.device_mut(dev).install_spec(dev, spec);
    }

    pub(crate) fn device_geometry(&mut self, dev: u32) -> Result<(u32, u32, u32)> {
        let spec = self.device_spec(dev)?;
        Ok((spec.num_sms, spec.num_warps, spec.num_lanes))
    }

    /// Whether any SM of the device has a valid warp.
    pub fn device_is_valid(&mut self, dev: u32) -> Result<bool> {
        if let Some(&valid) = self.state.device(dev).valid.get() {
            return Ok(valid);
        }
        let (num_sms, _, _) = self.device_geometry(dev)?;
        let mut valid = false;
        for sm in 0..num_sms {
            if !self.sm_valid_warps_mask(dev, sm)?.is_empty() {
                valid = true;
                break;
            }
        }
        let clock = self.clock;
        self.state.device_mut(dev).valid.set(valid, clock);
        Ok(valid)
    }

    /// SMs with at least one valid warp.
    pub fn device_active_sms_mask(&mut self, dev: u32) -> Result<SmMask> {
        let (num_sms, _, _) = self.device_geometry(dev)?;
        let mut mask = SmMask::empty();
        for sm in 0..num_sms {
            if !self.sm_valid_warps_mask(dev, sm)?.is_empty() {
                mask.set(sm);
            }
        }
        Ok(mask)
    }

    /// SMs of the device that report an exception.
    pub fn device_exception_sms_mask(&mut self, dev: u32) -> Result<SmMask> {
        self.device_spec(dev)?;
        let clock = self.clock;
        let api = &self.api;
        let mask = self
            .state
            .device_mut(dev)
            .exception_sms
            .get_or_try_fill(clock, || api.read_device_exception_state(dev))?;
        Ok(*mask)
    }

    pub fn device_has_exception(&mut self, dev: u32) -> Result<bool> {
        Ok(!self.device_exception_sms_mask(dev)?.is_empty())
    }

    pub fn device_is_suspended(&self, dev: u32) -> bool {
        self.state.suspended.contains(dev)
    }

    pub fn device_suspend(&mut self, dev: u32) -> Result<()> {
        self.api.suspend_device(dev)?;
        self.state.suspended.set(dev);
        common::log!(self.logs.state, "device {}: suspended", dev);
        Ok(())
    }

    /// Let a suspended device run. The device is invalidated either way.
    pub fn device_resume(&mut self, dev: u32) -> Result<()> {
        self.device_invalidate(dev);
        if !self.device_is_suspended(dev) {
            return Ok(());
        }
        self.api.resume_device(dev)?;
        self.state.suspended.clear(dev);
        self.clock_increment();
        common::log!(self.logs.state, "device {}: resumed", dev);
        Ok(())
    }

    /// Drop every cached field of the device and of the kernels running on it.
    pub fn device_invalidate(&mut self, dev: u32) {
        common::log_detail!(self.logs.state, "invalidate device {}", dev);
        self.state.device_mut(dev).invalidate();
        self.kernels.invalidate_device(dev);
    }

    // ========================================================================
    // SM
    // ========================================================================

    pub fn sm_valid_warps_mask(&mut self, dev: u32, sm: u32) -> Result<WarpMask> {
        self.device_spec(dev)?;
        let clock = self.clock;
        let api = &self.api;
        let mask = self
            .state
            .sm_mut(dev, sm)
            .valid_warps
            .get_or_try_fill(clock, || api.read_valid_warps(dev, sm))?;
        Ok(*mask)
    }

    pub fn sm_broken_warps_mask(&mut self, dev: u32, sm: u32) -> Result<WarpMask> {
        self.device_spec(dev)?;
        let clock = self.clock;
        let api = &self.api;
        let mask = self
            .state
            .sm_mut(dev, sm)
            .broken_warps
            .get_or_try_fill(clock, || api.read_broken_warps(dev, sm))?;
        Ok(*mask)
    }

    pub fn sm_is_valid(&mut self, dev: u32, sm: u32) -> Result<bool> {
        Ok(!self.sm_valid_warps_mask(dev, sm)?.is_empty())
    }

    pub fn sm_has_exception(&mut self, dev: u32, sm: u32) -> Result<bool> {
        Ok(self.device_exception_sms_mask(dev)?.contains(sm))
    }

    pub fn sm_invalidate(&mut self, dev: u32, sm: u32) {
        if !self.state.is_populated(dev) {
            return;
        }
        common::log_detail!(self.logs.state, "invalidate sm {}/{}", dev, sm);
        self.state.sm_mut(dev, sm).invalidate();
    }

    // ========================================================================
    // Warp
    // ========================================================================

    pub fn warp_is_valid(&mut self, dev: u32, sm: u32, wp: u32) -> Result<bool> {
        Ok(self.sm_valid_warps_mask(dev, sm)?.contains(wp))
    }

    pub fn warp_is_broken(&mut self, dev: u32, sm: u32, wp: u32) -> Result<bool> {
        Ok(self.sm_broken_warps_mask(dev, sm)?.contains(wp))
    }

    fn assert_warp_valid(&mut self, dev: u32, sm: u32, wp: u32) -> Result<()> {
        let valid = self.warp_is_valid(dev, sm, wp)?;
        assert!(valid, "warp {}/{}/{} is not valid", dev, sm, wp);
        Ok(())
    }

    /// Fetch the warp snapshot unless `present` says the wanted cell is filled.
    fn fetch_warp_state(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        present: impl Fn(&WarpCache) -> bool,
    ) -> Result<()> {
        self.assert_warp_valid(dev, sm, wp)?;
        if present(self.state.warp_mut(dev, sm, wp)) {
            return Ok(());
        }
        let sm_has_exception = self.sm_has_exception(dev, sm)?;
        let snap = self.api.read_warp_state(dev, sm, wp)?;
        common::log_detail!(self.logs.state, "warp {}/{}/{}: fetched state, grid {}", dev, sm, wp, snap.grid_id);
        let clock = self.clock;
        self.state.warp_mut(dev, sm, wp).fill(snap, sm_has_exception, clock);
        Ok(())
    }

    pub fn warp_valid_lanes_mask(&mut self, dev: u32, sm: u32, wp: u32) -> Result<LaneMask> {
        self.fetch_warp_state(dev, sm, wp, |w| w.valid_lanes.is_valid())?;
        self.state
            .warp_mut(dev, sm, wp)
            .valid_lanes
            .get()
            .copied()
            .ok_or_else(|| stale("valid lanes", dev, sm, wp, None))
    }

    pub fn warp_active_lanes_mask(&mut self, dev: u32, sm: u32, wp: u32) -> Result<LaneMask> {
        self.fetch_warp_state(dev, sm, wp, |w| w.active_lanes.is_valid())?;
        self.state
            .warp_mut(dev, sm, wp)
            .active_lanes
            .get()
            .copied()
            .ok_or_else(|| stale("active lanes", dev, sm, wp, None))
    }

    /// Valid lanes that are not active.
    pub fn warp_divergent_lanes_mask(&mut self, dev: u32, sm: u32, wp: u32) -> Result<LaneMask> {
        let valid = self.warp_valid_lanes_mask(dev, sm, wp)?;
        let active = self.warp_active_lanes_mask(dev, sm, wp)?;
        Ok(valid.and_not(&active))
    }

    pub fn warp_lowest_active_lane(&mut self, dev: u32, sm: u32, wp: u32) -> Result<Option<u32>> {
        Ok(self.warp_active_lanes_mask(dev, sm, wp)?.lowest())
    }

    pub fn warp_grid_id(&mut self, dev: u32, sm: u32, wp: u32) -> Result<GridId> {
        self.fetch_warp_state(dev, sm, wp, |w| w.grid_id.is_valid())?;
        self.state
            .warp_mut(dev, sm, wp)
            .grid_id
            .get()
            .copied()
            .ok_or_else(|| stale("grid id", dev, sm, wp, None))
    }

    pub fn warp_block_idx(&mut self, dev: u32, sm: u32, wp: u32) -> Result<Dim3> {
        self.fetch_warp_state(dev, sm, wp, |w| w.block_idx.is_valid())?;
        self.state
            .warp_mut(dev, sm, wp)
            .block_idx
            .get()
            .copied()
            .ok_or_else(|| stale("block index", dev, sm, wp, None))
    }

    /// Kernel the warp belongs to, registering it on first sight.
    pub fn warp_kernel(&mut self, dev: u32, sm: u32, wp: u32) -> Result<KernelId> {
        self.assert_warp_valid(dev, sm, wp)?;
        if let Some(&id) = self.state.warp_mut(dev, sm, wp).kernel.get() {
            return Ok(id);
        }
        let grid_id = self.warp_grid_id(dev, sm, wp)?;
        let id = self.kernel_for_grid(dev, grid_id)?;
        let clock = self.clock;
        self.state.warp_mut(dev, sm, wp).kernel.set(id, clock);
        Ok(id)
    }

    /// Physical PC of the lowest active lane.
    pub fn warp_active_pc(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u64> {
        let ln = self
            .warp_lowest_active_lane(dev, sm, wp)?
            .ok_or_else(|| stale("active lane", dev, sm, wp, None))?;
        self.lane_pc(dev, sm, wp, ln)
    }

    /// Virtual PC of the lowest active lane.
    pub fn warp_active_virtual_pc(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u64> {
        let ln = self
            .warp_lowest_active_lane(dev, sm, wp)?
            .ok_or_else(|| stale("active lane", dev, sm, wp, None))?;
        self.lane_virtual_pc(dev, sm, wp, ln)
    }

    pub fn warp_has_error_pc(&mut self, dev: u32, sm: u32, wp: u32) -> Result<bool> {
        self.fetch_warp_state(dev, sm, wp, |w| w.error_pc.is_valid())?;
        Ok(matches!(self.state.warp_mut(dev, sm, wp).error_pc.get(), Some(Some(_))))
    }

    /// PC of the faulting instruction. The warp must have one.
    pub fn warp_error_pc(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u64> {
        self.fetch_warp_state(dev, sm, wp, |w| w.error_pc.is_valid())?;
        let error_pc = self.state.warp_mut(dev, sm, wp).error_pc.get().copied().flatten();
        assert!(error_pc.is_some(), "warp {}/{}/{} has no error PC", dev, sm, wp);
        error_pc.ok_or_else(|| stale("error pc", dev, sm, wp, None))
    }

    /// Clock value at which the warp was first observed in this epoch.
    pub fn warp_timestamp(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u64> {
        self.assert_warp_valid(dev, sm, wp)?;
        let clock = self.clock;
        let ts = self
            .state
            .warp_mut(dev, sm, wp)
            .timestamp
            .get_or_try_fill(clock, || Ok::<_, DebugError>(clock))?;
        Ok(*ts)
    }

    pub fn warp_set_grid_id(&mut self, dev: u32, sm: u32, wp: u32, grid_id: GridId) -> Result<()> {
        self.device_spec(dev)?;
        let clock = self.clock;
        self.state.warp_mut(dev, sm, wp).grid_id.set(grid_id, clock);
        Ok(())
    }

    pub fn warp_set_block_idx(&mut self, dev: u32, sm: u32, wp: u32, block_idx: Dim3) -> Result<()> {
        self.device_spec(dev)?;
        let clock = self.clock;
        self.state.warp_mut(dev, sm, wp).block_idx.set(block_idx, clock);
        Ok(())
    }

    pub fn warp_invalidate(&mut self, dev: u32, sm: u32, wp: u32) {
        if !self.state.is_populated(dev) {
            return;
        }
        common::log_detail!(self.logs.state, "invalidate warp {}/{}/{}", dev, sm, wp);
        self.state.warp_mut(dev, sm, wp).invalidate();
    }

    /// Invalidate what a step or resume of the masked warps may have changed.
    fn invalidate_after_execution(&mut self, dev: u32, sm: u32, warps: WarpMask) {
        for wp in warps.iter() {
            self.warp_invalidate(dev, sm, wp);
        }
        self.state.sm_mut(dev, sm).invalidate_masks();
        let device = self.state.device_mut(dev);
        device.valid.invalidate();
        device.exception_sms.invalidate();
        self.kernels.invalidate_device(dev);
    }

    /// Step one warp by `nsteps` instructions and invalidate what moved.
    /// Returns every warp the target reports as stepped.
    pub fn warp_single_step(&mut self, dev: u32, sm: u32, wp: u32, nsteps: u32) -> Result<WarpMask> {
        self.device_spec(dev)?;
        common::log!(self.logs.state, "warp {}/{}/{}: step {}", dev, sm, wp, nsteps);
        let stepped = self.api.single_step_warp(dev, sm, wp, nsteps)?;
        self.clock_increment();

        if self.config.software_preemption {
            self.device_invalidate(dev);
            return Ok(stepped);
        }

        let mut this_warp = WarpMask::empty();
        this_warp.set(wp);
        let others = stepped.and_not(&this_warp);
        if !others.is_empty() {
            self.warn(format!(
                "Warp(s) other than the current warp had to be single-stepped:{}",
                others
            ));
            self.device_invalidate(dev);
            return Ok(stepped);
        }

        self.invalidate_after_execution(dev, sm, stepped);
        Ok(stepped)
    }

    /// Run the masked warps of an SM until they reach `pc`. Nothing happens,
    /// and false is returned, if one of them is already there.
    pub fn warps_resume_until(&mut self, dev: u32, sm: u32, mask: WarpMask, pc: u64) -> Result<bool> {
        for wp in mask.iter() {
            if self.warp_is_valid(dev, sm, wp)? && self.warp_active_pc(dev, sm, wp)? == pc {
                return Ok(false);
            }
        }

        self.api.resume_warps_until_pc(dev, sm, mask, pc)?;
        self.clock_increment();
        common::log!(self.logs.state, "sm {}/{}: resumed warps {} until 0x{:x}", dev, sm, mask, pc);

        if self.config.software_preemption {
            self.device_invalidate(dev);
        } else {
            self.invalidate_after_execution(dev, sm, mask);
        }
        Ok(true)
    }

    // ========================================================================
    // Lane
    // ========================================================================

    pub fn lane_is_valid(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<bool> {
        if !self.warp_is_valid(dev, sm, wp)? {
            return Ok(false);
        }
        Ok(self.warp_valid_lanes_mask(dev, sm, wp)?.contains(ln))
    }

    pub fn lane_is_active(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<bool> {
        if !self.warp_is_valid(dev, sm, wp)? {
            return Ok(false);
        }
        Ok(self.warp_active_lanes_mask(dev, sm, wp)?.contains(ln))
    }

    pub fn lane_is_divergent(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<bool> {
        Ok(self.warp_divergent_lanes_mask(dev, sm, wp)?.contains(ln))
    }

    fn assert_lane_valid(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<()> {
        let valid = self.lane_is_valid(dev, sm, wp, ln)?;
        assert!(valid, "lane {}/{}/{}/{} is not valid", dev, sm, wp, ln);
        Ok(())
    }

    /// Physical PC of a lane. Active lanes share one PC, so reading it for
    /// one active lane fills the cell of every active lane.
    pub fn lane_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        if let Some(&pc) = self.state.lane_mut(dev, sm, wp, ln).pc.get() {
            return Ok(pc);
        }

        let pc = self.api.read_pc(dev, sm, wp, ln)?;
        let clock = self.clock;
        if self.lane_is_active(dev, sm, wp, ln)? {
            let active = self.warp_active_lanes_mask(dev, sm, wp)?;
            let warp = self.state.warp_mut(dev, sm, wp);
            for other in active.iter() {
                if let Some(lane) = warp.lanes.get_mut(other as usize) {
                    lane.pc.set_if_empty(pc, clock);
                }
            }
        }
        self.state.lane_mut(dev, sm, wp, ln).pc.set(pc, clock);
        Ok(pc)
    }

    pub fn lane_virtual_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        self.fetch_warp_state(dev, sm, wp, |w| w.lanes[ln as usize].virtual_pc.is_valid())?;
        self.state
            .lane_mut(dev, sm, wp, ln)
            .virtual_pc
            .get()
            .copied()
            .ok_or_else(|| stale("virtual pc", dev, sm, wp, Some(ln)))
    }

    pub fn lane_thread_idx(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<Dim3> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        self.fetch_warp_state(dev, sm, wp, |w| w.lanes[ln as usize].thread_idx.is_valid())?;
        self.state
            .lane_mut(dev, sm, wp, ln)
            .thread_idx
            .get()
            .copied()
            .ok_or_else(|| stale("thread index", dev, sm, wp, Some(ln)))
    }

    /// Exception raised by a lane. Lanes of SMs without a pending
    /// exception report none without asking the target.
    pub fn lane_exception(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<ExceptionKind> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        if !self.sm_has_exception(dev, sm)? {
            let clock = self.clock;
            self.state
                .lane_mut(dev, sm, wp, ln)
                .exception
                .set_if_empty(ExceptionKind::None, clock);
        }
        self.fetch_warp_state(dev, sm, wp, |w| w.lanes[ln as usize].exception.is_valid())?;
        self.state
            .lane_mut(dev, sm, wp, ln)
            .exception
            .get()
            .copied()
            .ok_or_else(|| stale("exception", dev, sm, wp, Some(ln)))
    }

    pub fn lane_timestamp(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        let clock = self.clock;
        let ts = self
            .state
            .lane_mut(dev, sm, wp, ln)
            .timestamp
            .get_or_try_fill(clock, || Ok::<_, DebugError>(clock))?;
        Ok(*ts)
    }

    /// Read a register. Low registers are fetched in aligned batches and
    /// cached; the rest go to the target every time.
    pub fn lane_register(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32) -> Result<u32> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        if regno >= CACHED_REGISTERS {
            return Ok(self.api.read_register(dev, sm, wp, ln, regno)?);
        }

        let cached = self
            .state
            .lane_mut(dev, sm, wp, ln)
            .registers
            .get(regno as usize)
            .copied()
            .flatten();
        if let Some(value) = cached {
            return Ok(value);
        }

        let num_registers = self.device_spec(dev)?.num_registers;
        let first = regno - regno % REGISTER_BATCH;
        let count = REGISTER_BATCH.min(num_registers.saturating_sub(first));
        if count == 0 || regno >= first + count {
            return Ok(self.api.read_register(dev, sm, wp, ln, regno)?);
        }

        let values = self.api.read_register_range(dev, sm, wp, ln, first, count)?;
        let lane = self.state.lane_mut(dev, sm, wp, ln);
        if lane.registers.len() < CACHED_REGISTERS as usize {
            lane.registers.resize(CACHED_REGISTERS as usize, None);
        }
        for (i, value) in values.iter().enumerate() {
            lane.registers[first as usize + i] = Some(*value);
        }
        values
            .get((regno - first) as usize)
            .copied()
            .ok_or_else(|| stale("register", dev, sm, wp, Some(ln)))
    }

    /// Write a register through to the target and update the cache.
    pub fn lane_set_register(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32, value: u32) -> Result<()> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        self.api.write_register(dev, sm, wp, ln, regno, value)?;
        let lane = self.state.lane_mut(dev, sm, wp, ln);
        if let Some(slot) = lane.registers.get_mut(regno as usize) {
            *slot = Some(value);
        }
        Ok(())
    }

    fn lane_predicates(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<Vec<bool>> {
        let count = self.device_spec(dev)?.num_predicates;
        let clock = self.clock;
        let api = &self.api;
        let preds = self
            .state
            .lane_mut(dev, sm, wp, ln)
            .predicates
            .get_or_try_fill(clock, || api.read_predicates(dev, sm, wp, ln, count))?;
        Ok(preds.clone())
    }

    /// Read a predicate register. Predicate 7 is always true.
    pub fn lane_predicate(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, predicate: u32) -> Result<bool> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        if predicate == PREDICATE_TRUE {
            return Ok(true);
        }
        let preds = self.lane_predicates(dev, sm, wp, ln)?;
        assert!((predicate as usize) < preds.len(), "predicate {} out of range", predicate);
        Ok(preds[predicate as usize])
    }

    pub fn lane_set_predicate(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, predicate: u32, value: bool) -> Result<()> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        if predicate == PREDICATE_TRUE {
            return Ok(());
        }
        let mut preds = self.lane_predicates(dev, sm, wp, ln)?;
        assert!((predicate as usize) < preds.len(), "predicate {} out of range", predicate);
        preds[predicate as usize] = value;
        self.api.write_predicates(dev, sm, wp, ln, &preds)?;
        let clock = self.clock;
        self.state.lane_mut(dev, sm, wp, ln).predicates.set(preds, clock);
        Ok(())
    }

    /// Call depth of a lane; 0 is the kernel's outermost frame. Not cached.
    pub fn lane_call_depth(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u32> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        Ok(self.api.read_call_depth(dev, sm, wp, ln)?)
    }

    pub fn lane_set_thread_idx(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, thread_idx: Dim3) -> Result<()> {
        self.device_spec(dev)?;
        let clock = self.clock;
        self.state.lane_mut(dev, sm, wp, ln).thread_idx.set(thread_idx, clock);
        Ok(())
    }

    pub fn lane_invalidate(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) {
        if self.state.is_populated(dev) {
            self.state.lane_mut(dev, sm, wp, ln).invalidate();
        }
    }

    // ========================================================================
    // System
    // ========================================================================

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub(crate) fn clock_increment(&mut self) {
        self.clock = self.clock.wrapping_add(1);
        if self.clock == 0 {
            self.warn("The internal clock counter used for debugging wrapped around.".to_string());
        }
    }

    /// Whether a warp observed at or after `clock` is stopped at a breakpoint.
    pub fn system_is_broken(&mut self, clock: u64) -> Result<bool> {
        let mut iter = CoordIterator::warps(Coords::wildcard(), SelectFlags::VALID);
        iter.start(self)?;
        while let Some(c) = iter.current().copied() {
            if let (Some(dev), Some(sm), Some(wp)) = (c.dev, c.sm, c.wp) {
                if self.warp_timestamp(dev, sm, wp)? >= clock && self.warp_is_broken(dev, sm, wp)? {
                    return Ok(true);
                }
            }
            iter.next(self)?;
        }
        Ok(false)
    }

    /// Drop every cached field of every device and kernel.
    pub fn invalidate_all(&mut self) {
        common::log!(self.logs.state, "invalidate all");
        self.state.invalidate_all();
        self.kernels.invalidate_all();
    }
}
