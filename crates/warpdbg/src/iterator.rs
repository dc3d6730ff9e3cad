//! Coordinate iteration
//!
//! A [`CoordIterator`] walks the hardware in device, SM, warp, lane order and
//! stops on every position that passes its filter and selection flags. It
//! keeps only a cursor: every step re-reads validity from the state cache, so
//! a warp that vanished since the previous step is skipped rather than
//! reported. Restarting with [`CoordIterator::start`] begins a fresh walk.

use crate::coords::Coords;
use crate::error::Result;
use crate::session::DebugSession;
use crate::target::DebugTarget;
use bitflags::bitflags;

bitflags! {
    /// Selection criteria applied on top of the coordinate filter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SelectFlags: u8 {
        /// Only valid lanes
        const VALID = 1 << 0;
        /// Only warps stopped at a breakpoint
        const BREAKPOINT = 1 << 1;
        /// Only lanes (or warps with a lane) raising an exception
        const EXCEPTION = 1 << 2;
        /// Stop after the first match
        const SINGLE = 1 << 3;
        /// Only nodes observed at or after the current clock
        const CURRENT_CLOCK = 1 << 4;
    }
}

/// Granularity of the walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorKind {
    Threads,
    Warps,
}

type Position = (u32, u32, u32, u32);

/// Restartable, lazily evaluated walk over matching coordinates.
#[derive(Debug, Clone)]
pub struct CoordIterator {
    kind: IteratorKind,
    filter: Coords,
    select: SelectFlags,
    position: Option<Position>,
    current: Option<Coords>,
    matched: u32,
}

impl CoordIterator {
    pub fn new(kind: IteratorKind, filter: Coords, select: SelectFlags) -> Self {
        Self {
            kind,
            filter,
            select,
            position: None,
            current: None,
            matched: 0,
        }
    }

    pub fn warps(filter: Coords, select: SelectFlags) -> Self {
        Self::new(IteratorKind::Warps, filter, select)
    }

    pub fn threads(filter: Coords, select: SelectFlags) -> Self {
        Self::new(IteratorKind::Threads, filter, select)
    }

    pub fn kind(&self) -> IteratorKind {
        self.kind
    }

    pub fn filter(&self) -> &Coords {
        &self.filter
    }

    /// Position on the first match.
    pub fn start<A: DebugTarget>(&mut self, session: &mut DebugSession<A>) -> Result<()> {
        self.matched = 0;
        self.current = None;
        let origin = (
            self.filter.dev.unwrap_or(0),
            self.filter.sm.unwrap_or(0),
            self.filter.wp.unwrap_or(0),
            self.filter.ln.unwrap_or(0),
        );
        self.seek(session, origin)
    }

    /// Advance past the current match.
    pub fn next<A: DebugTarget>(&mut self, session: &mut DebugSession<A>) -> Result<()> {
        let Some((dev, sm, wp, ln)) = self.position else {
            return Ok(());
        };
        if self.select.contains(SelectFlags::SINGLE) && self.matched > 0 {
            self.finish();
            return Ok(());
        }
        let after = match self.kind {
            IteratorKind::Warps => (dev, sm, wp + 1, 0),
            IteratorKind::Threads => (dev, sm, wp, ln + 1),
        };
        self.seek(session, after)
    }

    /// Fully resolved coordinates of the current match; `None` at the end.
    pub fn current(&self) -> Option<&Coords> {
        self.current.as_ref()
    }

    pub fn end(&self) -> bool {
        self.current.is_none()
    }

    /// Number of matches produced since `start`.
    pub fn matched(&self) -> u32 {
        self.matched
    }

    /// Run a full walk and return every match.
    pub fn collect<A: DebugTarget>(&mut self, session: &mut DebugSession<A>) -> Result<Vec<Coords>> {
        let mut out = Vec::new();
        self.start(session)?;
        while let Some(c) = self.current {
            out.push(c);
            self.next(session)?;
        }
        Ok(out)
    }

    fn finish(&mut self) {
        self.position = None;
        self.current = None;
    }

    fn seek<A: DebugTarget>(&mut self, s: &mut DebugSession<A>, from: Position) -> Result<()> {
        let (mut dev, mut sm, mut wp, mut ln) = from;
        let num_devices = s.device_count();

        while dev < num_devices {
            if self.filter.dev.is_some_and(|d| d != dev) {
                break;
            }
            let (num_sms, num_warps, num_lanes) = s.device_geometry(dev)?;
            while sm < num_sms {
                if self.filter.sm.is_some_and(|f| f != sm) {
                    break;
                }
                while wp < num_warps {
                    if self.filter.wp.is_some_and(|f| f != wp) {
                        break;
                    }
                    if self.warp_selected(s, dev, sm, wp)? {
                        match self.kind {
                            IteratorKind::Warps => {
                                if let Some(coords) = self.warp_coords(s, dev, sm, wp)? {
                                    if self.filter.matches(&coords) {
                                        return self.found(s, (dev, sm, wp, 0), coords);
                                    }
                                }
                            }
                            IteratorKind::Threads => {
                                while ln < num_lanes {
                                    if self.filter.ln.is_some_and(|f| f != ln) {
                                        break;
                                    }
                                    if let Some(coords) = self.lane_coords(s, dev, sm, wp, ln)? {
                                        return self.found(s, (dev, sm, wp, ln), coords);
                                    }
                                    ln += 1;
                                }
                            }
                        }
                    }
                    wp += 1;
                    ln = self.filter.ln.unwrap_or(0);
                }
                sm += 1;
                wp = self.filter.wp.unwrap_or(0);
                ln = self.filter.ln.unwrap_or(0);
            }
            dev += 1;
            sm = self.filter.sm.unwrap_or(0);
            wp = self.filter.wp.unwrap_or(0);
            ln = self.filter.ln.unwrap_or(0);
        }

        self.finish();
        Ok(())
    }

    fn found<A: DebugTarget>(&mut self, s: &DebugSession<A>, at: Position, coords: Coords) -> Result<()> {
        common::log_detail!(s.logs.iterator, "match {}", coords);
        self.position = Some(at);
        self.current = Some(coords);
        self.matched += 1;
        Ok(())
    }

    /// Warp-level checks shared by both kinds. Only resident warps can be
    /// resolved, so invalid warps never match.
    fn warp_selected<A: DebugTarget>(&self, s: &mut DebugSession<A>, dev: u32, sm: u32, wp: u32) -> Result<bool> {
        if !s.warp_is_valid(dev, sm, wp)? {
            return Ok(false);
        }
        if self.select.contains(SelectFlags::BREAKPOINT) && !s.warp_is_broken(dev, sm, wp)? {
            return Ok(false);
        }
        if self.select.contains(SelectFlags::EXCEPTION) && !s.sm_has_exception(dev, sm)? {
            return Ok(false);
        }
        if self.select.contains(SelectFlags::CURRENT_CLOCK) && s.warp_timestamp(dev, sm, wp)? < s.clock() {
            return Ok(false);
        }
        if let Some(grid_id) = self.filter.grid_id {
            if s.warp_grid_id(dev, sm, wp)? != grid_id {
                return Ok(false);
            }
        }
        if let Some(block_idx) = self.filter.block_idx {
            if s.warp_block_idx(dev, sm, wp)? != block_idx {
                return Ok(false);
            }
        }
        if let Some(kernel_id) = self.filter.kernel_id {
            if s.warp_kernel(dev, sm, wp)? != kernel_id {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn warp_coords<A: DebugTarget>(&self, s: &mut DebugSession<A>, dev: u32, sm: u32, wp: u32) -> Result<Option<Coords>> {
        let coords = Coords::wildcard()
            .with_dev(dev)
            .with_sm(sm)
            .with_warp(wp)
            .with_kernel(s.warp_kernel(dev, sm, wp)?)
            .with_grid(s.warp_grid_id(dev, sm, wp)?)
            .with_block(s.warp_block_idx(dev, sm, wp)?);

        // Report the lowest active lane, or with EXCEPTION the lowest
        // faulting one
        let lane = if self.select.contains(SelectFlags::EXCEPTION) {
            let mut raised = None;
            for ln in s.warp_valid_lanes_mask(dev, sm, wp)?.iter() {
                if !s.lane_exception(dev, sm, wp, ln)?.is_none() {
                    raised = Some(ln);
                    break;
                }
            }
            match raised {
                Some(ln) => Some(ln),
                None => return Ok(None),
            }
        } else {
            match s.warp_lowest_active_lane(dev, sm, wp)? {
                Some(ln) => Some(ln),
                None => s.warp_valid_lanes_mask(dev, sm, wp)?.lowest(),
            }
        };

        Ok(Some(match lane {
            Some(ln) => coords.with_lane(ln).with_thread(s.lane_thread_idx(dev, sm, wp, ln)?),
            None => coords,
        }))
    }

    fn lane_coords<A: DebugTarget>(
        &self,
        s: &mut DebugSession<A>,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
    ) -> Result<Option<Coords>> {
        let valid = s.lane_is_valid(dev, sm, wp, ln)?;
        if self.select.contains(SelectFlags::VALID) && !valid {
            return Ok(None);
        }

        let mut coords = Coords::physical(dev, sm, wp, ln)
            .with_kernel(s.warp_kernel(dev, sm, wp)?)
            .with_grid(s.warp_grid_id(dev, sm, wp)?)
            .with_block(s.warp_block_idx(dev, sm, wp)?);

        if !valid {
            // an empty lane slot has no thread; it can only match a filter
            // that does not ask for one
            return Ok((self.filter.thread_idx.is_none()
                && !self.select.intersects(SelectFlags::EXCEPTION | SelectFlags::CURRENT_CLOCK))
            .then_some(coords));
        }

        coords = coords.with_thread(s.lane_thread_idx(dev, sm, wp, ln)?);
        if !self.filter.matches(&coords) {
            return Ok(None);
        }
        if self.select.contains(SelectFlags::EXCEPTION) && s.lane_exception(dev, sm, wp, ln)?.is_none() {
            return Ok(None);
        }
        if self.select.contains(SelectFlags::CURRENT_CLOCK) && s.lane_timestamp(dev, sm, wp, ln)? < s.clock() {
            return Ok(None);
        }
        Ok(Some(coords))
    }
}

impl<A: DebugTarget> DebugSession<A> {
    /// Find where a logical thread (kernel, grid, block, thread) currently
    /// runs. `None` once the thread has finished.
    pub fn resolve_physical(&mut self, coords: &Coords) -> Result<Option<Coords>> {
        let mut filter = coords.logical_part();
        filter.dev = coords.dev;
        let mut iter = CoordIterator::threads(filter, SelectFlags::VALID | SelectFlags::SINGLE);
        iter.start(self)?;
        Ok(iter.current().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mask::LaneMask;
    use crate::mock::{grid_info, spec, MockTarget};
    use crate::source_map::SourceMapper;
    use crate::types::{Dim3, ExceptionKind, GridStatus};

    fn session() -> DebugSession<MockTarget> {
        let mut target = MockTarget::new(vec![spec(2, 4, 4), spec(1, 2, 4)]);
        target.add_warp(0, 0, 0, 7, 0x100);
        target.add_warp(0, 0, 3, 7, 0x100);
        target.add_warp(0, 1, 1, 8, 0x200);
        target.add_warp(1, 0, 1, 2, 0x300);
        target.warp_mut(0, 0, 3).broken = false;
        target.add_grid(grid_info(0, 7, 0x100, None), GridStatus::Active);
        target.add_grid(grid_info(0, 8, 0x200, None), GridStatus::Active);
        target.add_grid(grid_info(1, 2, 0x300, None), GridStatus::Active);
        DebugSession::open(target, Box::new(SourceMapper::default()), SessionConfig::default()).unwrap()
    }

    fn warps(c: &[Coords]) -> Vec<(u32, u32, u32)> {
        c.iter()
            .map(|c| (c.dev.unwrap(), c.sm.unwrap(), c.wp.unwrap()))
            .collect()
    }

    #[test]
    fn test_warps_in_physical_order() {
        let mut s = session();
        let all = CoordIterator::warps(Coords::wildcard(), SelectFlags::VALID)
            .collect(&mut s)
            .unwrap();
        assert_eq!(warps(&all), vec![(0, 0, 0), (0, 0, 3), (0, 1, 1), (1, 0, 1)]);
        assert!(all.iter().all(|c| c.is_fully_physical() && c.is_fully_logical()));
    }

    #[test]
    fn test_filters() {
        let mut s = session();
        let grid7 = CoordIterator::warps(Coords::wildcard().with_dev(0).with_grid(7), SelectFlags::VALID)
            .collect(&mut s)
            .unwrap();
        assert_eq!(warps(&grid7), vec![(0, 0, 0), (0, 0, 3)]);

        let sm1 = CoordIterator::warps(Coords::wildcard().with_sm(1), SelectFlags::VALID)
            .collect(&mut s)
            .unwrap();
        assert_eq!(warps(&sm1), vec![(0, 1, 1)]);

        let broken = CoordIterator::warps(Coords::wildcard(), SelectFlags::VALID | SelectFlags::BREAKPOINT)
            .collect(&mut s)
            .unwrap();
        assert_eq!(warps(&broken), vec![(0, 0, 0), (0, 1, 1), (1, 0, 1)]);

        let block = CoordIterator::warps(Coords::wildcard().with_block(Dim3::new(1, 1, 0)), SelectFlags::VALID)
            .collect(&mut s)
            .unwrap();
        assert_eq!(warps(&block), vec![(0, 1, 1)]);
    }

    #[test]
    fn test_single_stops_after_first() {
        let mut s = session();
        let mut iter = CoordIterator::warps(Coords::wildcard(), SelectFlags::VALID | SelectFlags::SINGLE);
        iter.start(&mut s).unwrap();
        assert!(!iter.end());
        iter.next(&mut s).unwrap();
        assert!(iter.end());
        assert_eq!(iter.matched(), 1);
    }

    #[test]
    fn test_threads_visit_valid_lanes() {
        let mut s = session();
        let mut valid = LaneMask::empty();
        valid.set(1);
        valid.set(3);
        s.api_mut().warp_mut(0, 0, 0).valid = valid;
        s.api_mut().warp_mut(0, 0, 0).active = valid;

        let filter = Coords::wildcard().with_dev(0).with_sm(0).with_warp(0);
        let lanes: Vec<u32> = CoordIterator::threads(filter, SelectFlags::VALID)
            .collect(&mut s)
            .unwrap()
            .iter()
            .map(|c| c.ln.unwrap())
            .collect();
        assert_eq!(lanes, vec![1, 3]);

        let all = CoordIterator::threads(filter, SelectFlags::empty()).collect(&mut s).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all[0].thread_idx.is_none());
    }

    #[test]
    fn test_rechecks_validity_between_steps() {
        let mut s = session();
        let mut iter = CoordIterator::warps(Coords::wildcard().with_dev(0), SelectFlags::VALID);
        iter.start(&mut s).unwrap();
        assert_eq!(iter.current().and_then(|c| c.wp), Some(0));

        // warp 3 exits before the next step
        s.api_mut().warps.remove(&(0, 0, 3));
        s.sm_invalidate(0, 0);
        iter.next(&mut s).unwrap();
        assert_eq!(iter.current().map(|c| (c.sm, c.wp)), Some((Some(1), Some(1))));
        iter.next(&mut s).unwrap();
        assert!(iter.end());
        // stays at the end
        iter.next(&mut s).unwrap();
        assert!(iter.end());
    }

    #[test]
    fn test_exception_selection() {
        let mut s = session();
        s.api_mut().warp_mut(0, 1, 1).exception = Some((2, ExceptionKind::MisalignedAddress));
        let hits = CoordIterator::threads(Coords::wildcard(), SelectFlags::VALID | SelectFlags::EXCEPTION)
            .collect(&mut s)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!((hits[0].sm, hits[0].wp, hits[0].ln), (Some(1), Some(1), Some(2)));

        let warps_hit = CoordIterator::warps(Coords::wildcard(), SelectFlags::VALID | SelectFlags::EXCEPTION)
            .collect(&mut s)
            .unwrap();
        assert_eq!(warps(&warps_hit), vec![(0, 1, 1)]);
        assert_eq!(warps_hit[0].ln, Some(2));
    }

    #[test]
    fn test_resolve_physical() {
        let mut s = session();
        let logical = Coords::wildcard()
            .with_grid(8)
            .with_block(Dim3::new(1, 1, 0))
            .with_thread(Dim3::new(2, 0, 0));
        let found = s.resolve_physical(&logical).unwrap().unwrap();
        assert_eq!((found.dev, found.sm, found.wp, found.ln), (Some(0), Some(1), Some(1), Some(2)));

        s.api_mut().warps.remove(&(0, 1, 1));
        s.device_invalidate(0);
        assert!(s.resolve_physical(&logical).unwrap().is_none());
    }
}
