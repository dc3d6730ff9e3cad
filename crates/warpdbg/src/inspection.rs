//! Summaries of device state for inspection commands

use crate::coords::Coords;
use crate::error::Result;
use crate::iterator::{CoordIterator, SelectFlags};
use crate::mask::{LaneMask, SmMask, WarpMask};
use crate::session::DebugSession;
use crate::target::DebugTarget;
use crate::types::{Dim3, ExceptionKind, GridId, GridStatus, KernelId};

/// Information about a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub dev: u32,
    pub device_type: String,
    pub sm_type: String,
    pub num_sms: u32,
    pub num_warps: u32,
    pub num_lanes: u32,
    pub num_registers: u32,
    /// SMs with at least one resident warp
    pub active_sms: SmMask,
    pub has_exception: bool,
    pub suspended: bool,
}

/// Information about an SM with resident warps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmInfo {
    pub dev: u32,
    pub sm: u32,
    pub valid_warps: WarpMask,
    /// Warps stopped at a breakpoint
    pub broken_warps: WarpMask,
    pub has_exception: bool,
}

/// Information about a resident warp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarpInfo {
    pub dev: u32,
    pub sm: u32,
    pub wp: u32,
    pub kernel: KernelId,
    pub grid_id: GridId,
    pub block_idx: Dim3,
    pub valid_lanes: LaneMask,
    pub active_lanes: LaneMask,
    pub divergent_lanes: LaneMask,
    /// Virtual PC of the lowest active lane, if any lane is active
    pub active_pc: Option<u64>,
    pub error_pc: Option<u64>,
}

/// Information about a valid lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneInfo {
    pub coords: Coords,
    pub active: bool,
    pub pc: u64,
    pub exception: ExceptionKind,
}

/// Information about a tracked kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub id: KernelId,
    pub dev: u32,
    pub grid_id: GridId,
    pub parent: Option<KernelId>,
    pub name: String,
    pub args: Option<String>,
    /// `<<<grid,block>>>`
    pub dimensions: String,
    pub depth: u32,
    pub status: GridStatus,
    /// SMs running a warp of the kernel
    pub sms: SmMask,
}

/// Inspector for examining device state
pub struct Inspector;

impl Inspector {
    pub fn devices<A: DebugTarget>(s: &mut DebugSession<A>) -> Result<Vec<DeviceInfo>> {
        let mut out = Vec::new();
        for dev in 0..s.device_count() {
            let spec = s.device_spec(dev)?.clone();
            out.push(DeviceInfo {
                dev,
                device_type: spec.device_type,
                sm_type: spec.sm_type,
                num_sms: spec.num_sms,
                num_warps: spec.num_warps,
                num_lanes: spec.num_lanes,
                num_registers: spec.num_registers,
                active_sms: s.device_active_sms_mask(dev)?,
                has_exception: s.device_has_exception(dev)?,
                suspended: s.device_is_suspended(dev),
            });
        }
        Ok(out)
    }

    /// SMs of `dev` with resident warps
    pub fn sms<A: DebugTarget>(s: &mut DebugSession<A>, dev: u32) -> Result<Vec<SmInfo>> {
        let mut out = Vec::new();
        for sm in s.device_active_sms_mask(dev)?.iter() {
            out.push(SmInfo {
                dev,
                sm,
                valid_warps: s.sm_valid_warps_mask(dev, sm)?,
                broken_warps: s.sm_broken_warps_mask(dev, sm)?,
                has_exception: s.sm_has_exception(dev, sm)?,
            });
        }
        Ok(out)
    }

    /// Resident warps matching `filter`, in device/SM/warp order
    pub fn warps<A: DebugTarget>(s: &mut DebugSession<A>, filter: Coords) -> Result<Vec<WarpInfo>> {
        let mut out = Vec::new();
        for c in CoordIterator::warps(filter, SelectFlags::VALID).collect(s)? {
            let (Some(dev), Some(sm), Some(wp)) = (c.dev, c.sm, c.wp) else {
                continue;
            };
            let active_lanes = s.warp_active_lanes_mask(dev, sm, wp)?;
            let active_pc = if active_lanes.is_empty() {
                None
            } else {
                Some(s.warp_active_virtual_pc(dev, sm, wp)?)
            };
            let error_pc = if s.warp_has_error_pc(dev, sm, wp)? {
                Some(s.warp_error_pc(dev, sm, wp)?)
            } else {
                None
            };
            out.push(WarpInfo {
                dev,
                sm,
                wp,
                kernel: s.warp_kernel(dev, sm, wp)?,
                grid_id: s.warp_grid_id(dev, sm, wp)?,
                block_idx: s.warp_block_idx(dev, sm, wp)?,
                valid_lanes: s.warp_valid_lanes_mask(dev, sm, wp)?,
                active_lanes,
                divergent_lanes: s.warp_divergent_lanes_mask(dev, sm, wp)?,
                active_pc,
                error_pc,
            });
        }
        Ok(out)
    }

    /// Valid lanes matching `filter`
    pub fn lanes<A: DebugTarget>(s: &mut DebugSession<A>, filter: Coords) -> Result<Vec<LaneInfo>> {
        let mut out = Vec::new();
        for c in CoordIterator::threads(filter, SelectFlags::VALID).collect(s)? {
            let (Some(dev), Some(sm), Some(wp), Some(ln)) = (c.dev, c.sm, c.wp, c.ln) else {
                continue;
            };
            let active = s.lane_is_active(dev, sm, wp, ln)?;
            out.push(LaneInfo {
                coords: c,
                active,
                pc: s.lane_virtual_pc(dev, sm, wp, ln)?,
                exception: s.lane_exception(dev, sm, wp, ln)?,
            });
        }
        Ok(out)
    }

    pub fn kernels<A: DebugTarget>(s: &mut DebugSession<A>) -> Result<Vec<KernelInfo>> {
        let ids: Vec<KernelId> = s.kernels().iter().map(|k| k.id).collect();
        let mut out = Vec::new();
        for id in ids {
            let status = s.kernel_grid_status(id)?;
            let sms = s.kernel_sms_mask(id)?;
            let Some(k) = s.find_kernel_by_id(id) else {
                continue;
            };
            out.push(KernelInfo {
                id,
                dev: k.dev,
                grid_id: k.grid_id,
                parent: k.parent,
                name: k.name.clone(),
                args: k.args.clone(),
                dimensions: k.dimensions(),
                depth: k.depth,
                status,
                sms,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::{grid_info, spec, MockTarget};
    use crate::source_map::SourceMapper;

    fn session() -> DebugSession<MockTarget> {
        let mut target = MockTarget::new(vec![spec(2, 4, 4)]);
        target.add_warp(0, 0, 1, 7, 0x100);
        target.add_warp(0, 1, 0, 7, 0x140);
        target.warp_mut(0, 1, 0).active = LaneMask::from_bits(0b0011);
        target.warp_mut(0, 1, 0).exception = Some((1, ExceptionKind::MisalignedAddress));
        target.add_grid(grid_info(0, 7, 0x100, None), GridStatus::Active);
        DebugSession::open(target, Box::new(SourceMapper::default()), SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_devices() {
        let mut s = session();
        let devices = Inspector::devices(&mut s).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].num_sms, 2);
        assert_eq!(devices[0].active_sms.count(), 2);
        assert!(devices[0].has_exception);
    }

    #[test]
    fn test_sms_and_warps() {
        let mut s = session();
        let sms = Inspector::sms(&mut s, 0).unwrap();
        assert_eq!(sms.iter().map(|i| i.sm).collect::<Vec<_>>(), vec![0, 1]);
        assert!(!sms[0].has_exception);
        assert!(sms[1].has_exception);

        let warps = Inspector::warps(&mut s, Coords::wildcard()).unwrap();
        assert_eq!(warps.len(), 2);
        assert_eq!(warps[0].active_pc, Some(0x100));
        assert_eq!(warps[0].error_pc, None);
        assert_eq!(warps[1].divergent_lanes, LaneMask::from_bits(0b1100));
        assert_eq!(warps[1].error_pc, Some(0x140));
    }

    #[test]
    fn test_lanes_and_kernels() {
        let mut s = session();
        let lanes = Inspector::lanes(&mut s, Coords::wildcard().with_sm(1)).unwrap();
        assert_eq!(lanes.len(), 4);
        assert!(lanes[1].active);
        assert!(!lanes[2].active);
        assert_eq!(lanes[1].exception, ExceptionKind::MisalignedAddress);

        let kernels = Inspector::kernels(&mut s).unwrap();
        assert_eq!(kernels.len(), 1);
        assert_eq!(kernels[0].status, GridStatus::Active);
        assert_eq!(kernels[0].sms.count(), 2);
        assert_eq!(kernels[0].dimensions, "<<<(1,1,1),(32,1,1)>>>");
    }
}
