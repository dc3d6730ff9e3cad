//! Physical and logical coordinates

use crate::types::{Dim3, GridId, KernelId};
use std::fmt;

/// Names a lane, warp, SM or device on the hardware and/or a thread, block,
/// grid or kernel in the program. Unset fields are wildcards.
///
/// A coordinate used as a "current" position is either fully physical,
/// fully logical, or both. Any other mix is only meaningful as a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Coords {
    pub dev: Option<u32>,
    pub sm: Option<u32>,
    pub wp: Option<u32>,
    pub ln: Option<u32>,
    pub kernel_id: Option<KernelId>,
    pub grid_id: Option<GridId>,
    pub block_idx: Option<Dim3>,
    pub thread_idx: Option<Dim3>,
}

impl Coords {
    /// Matches everything.
    pub const fn wildcard() -> Self {
        Self {
            dev: None,
            sm: None,
            wp: None,
            ln: None,
            kernel_id: None,
            grid_id: None,
            block_idx: None,
            thread_idx: None,
        }
    }

    pub fn physical(dev: u32, sm: u32, wp: u32, ln: u32) -> Self {
        Self {
            dev: Some(dev),
            sm: Some(sm),
            wp: Some(wp),
            ln: Some(ln),
            ..Self::wildcard()
        }
    }

    pub fn logical(kernel_id: KernelId, grid_id: GridId, block_idx: Dim3, thread_idx: Dim3) -> Self {
        Self {
            kernel_id: Some(kernel_id),
            grid_id: Some(grid_id),
            block_idx: Some(block_idx),
            thread_idx: Some(thread_idx),
            ..Self::wildcard()
        }
    }

    pub fn with_dev(mut self, dev: u32) -> Self {
        self.dev = Some(dev);
        self
    }

    pub fn with_sm(mut self, sm: u32) -> Self {
        self.sm = Some(sm);
        self
    }

    pub fn with_warp(mut self, wp: u32) -> Self {
        self.wp = Some(wp);
        self
    }

    pub fn with_lane(mut self, ln: u32) -> Self {
        self.ln = Some(ln);
        self
    }

    pub fn with_kernel(mut self, kernel_id: KernelId) -> Self {
        self.kernel_id = Some(kernel_id);
        self
    }

    pub fn with_grid(mut self, grid_id: GridId) -> Self {
        self.grid_id = Some(grid_id);
        self
    }

    pub fn with_block(mut self, block_idx: Dim3) -> Self {
        self.block_idx = Some(block_idx);
        self
    }

    pub fn with_thread(mut self, thread_idx: Dim3) -> Self {
        self.thread_idx = Some(thread_idx);
        self
    }

    pub fn is_wildcard(&self) -> bool {
        *self == Self::wildcard()
    }

    /// Device, SM and warp are all known.
    pub fn is_warp_physical(&self) -> bool {
        self.dev.is_some() && self.sm.is_some() && self.wp.is_some()
    }

    pub fn is_fully_physical(&self) -> bool {
        self.is_warp_physical() && self.ln.is_some()
    }

    pub fn is_fully_logical(&self) -> bool {
        self.kernel_id.is_some()
            && self.grid_id.is_some()
            && self.block_idx.is_some()
            && self.thread_idx.is_some()
    }

    /// Only the logical part, with every physical field cleared.
    pub fn logical_part(&self) -> Self {
        Self {
            kernel_id: self.kernel_id,
            grid_id: self.grid_id,
            block_idx: self.block_idx,
            thread_idx: self.thread_idx,
            ..Self::wildcard()
        }
    }

    /// True when every field populated in both `self` and `other` is equal.
    pub fn matches(&self, other: &Coords) -> bool {
        fn agree<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        agree(&self.dev, &other.dev)
            && agree(&self.sm, &other.sm)
            && agree(&self.wp, &other.wp)
            && agree(&self.ln, &other.ln)
            && agree(&self.kernel_id, &other.kernel_id)
            && agree(&self.grid_id, &other.grid_id)
            && agree(&self.block_idx, &other.block_idx)
            && agree(&self.thread_idx, &other.thread_idx)
    }

    /// Same device, SM and warp.
    pub fn same_warp(&self, other: &Coords) -> bool {
        self.dev == other.dev && self.sm == other.sm && self.wp == other.wp
    }
}

fn field<T: fmt::Display>(f: &mut fmt::Formatter<'_>, name: &str, value: &Option<T>) -> fmt::Result {
    match value {
        Some(v) => write!(f, "{} {}", name, v),
        None => write!(f, "{} *", name),
    }
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        field(f, "kernel", &self.kernel_id)?;
        f.write_str(", ")?;
        field(f, "grid", &self.grid_id)?;
        f.write_str(", ")?;
        field(f, "block", &self.block_idx)?;
        f.write_str(", ")?;
        field(f, "thread", &self.thread_idx)?;
        f.write_str(", ")?;
        field(f, "device", &self.dev)?;
        f.write_str(", ")?;
        field(f, "sm", &self.sm)?;
        f.write_str(", ")?;
        field(f, "warp", &self.wp)?;
        f.write_str(", ")?;
        field(f, "lane", &self.ln)
    }
}
