//! Kernel registry
//!
//! Every grid observed on the hardware gets a [`Kernel`] record. Records form
//! a forest through device-side launches: a kernel knows its parent and its
//! children by id, and all records live in one arena owned by the registry.
//!
//! A kernel whose grid has terminated but which still has live children is
//! kept (a "zombie") so that its children keep a valid ancestry; it is
//! removed together with its last child.

use crate::cached::Cached;
use crate::error::Result;
use crate::iterator::{CoordIterator, SelectFlags};
use crate::mask::SmMask;
use crate::session::DebugSession;
use crate::source_map::{CodeInfo, SourceLocation};
use crate::target::DebugTarget;
use crate::types::{Dim3, GridId, GridInfo, GridStatus, KernelId, KernelOrigin, KernelType};
use crate::coords::Coords;
use debuginfo::Instruction;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

/// Memoised disassembly of a kernel's code
#[derive(Debug, Default)]
pub struct DisasmCache {
    entries: RefCell<HashMap<u64, Option<Instruction>>>,
}

impl DisasmCache {
    /// Disassemble `pc` through `code`, remembering the answer.
    pub fn lookup(&self, code: &dyn CodeInfo, pc: u64) -> Option<Instruction> {
        if let Some(hit) = self.entries.borrow().get(&pc) {
            return hit.clone();
        }
        let insn = code.disassemble(pc);
        self.entries.borrow_mut().insert(pc, insn.clone());
        insn
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) {
        self.entries.borrow_mut().clear();
    }
}

/// Code information seen through a kernel's disassembly cache.
pub struct KernelCode<'a> {
    code: &'a dyn CodeInfo,
    cache: Option<&'a DisasmCache>,
}

impl<'a> KernelCode<'a> {
    pub fn new(code: &'a dyn CodeInfo, cache: Option<&'a DisasmCache>) -> Self {
        Self { code, cache }
    }
}

impl CodeInfo for KernelCode<'_> {
    fn line_for_pc(&self, pc: u64) -> Option<SourceLocation> {
        self.code.line_for_pc(pc)
    }

    fn pcs_for_line(&self, file: &str, line: u32) -> Vec<u64> {
        self.code.pcs_for_line(file, line)
    }

    fn disassemble(&self, pc: u64) -> Option<Instruction> {
        match self.cache {
            Some(cache) => cache.lookup(self.code, pc),
            None => self.code.disassemble(pc),
        }
    }

    fn function_name(&self, pc: u64) -> Option<String> {
        self.code.function_name(pc)
    }

    fn function_range(&self, pc: u64) -> Option<(u64, u64)> {
        self.code.function_range(pc)
    }

    fn function_address(&self, name: &str) -> Option<u64> {
        self.code.function_address(name)
    }

    fn resolve_line(&self, file: &str, line: u32) -> Option<u64> {
        self.code.resolve_line(file, line)
    }
}

/// The debugger's tracking record for one launched grid
#[derive(Debug)]
pub struct Kernel {
    pub id: KernelId,
    pub dev: u32,
    pub grid_id: GridId,
    pub parent: Option<KernelId>,
    pub children: Vec<KernelId>,
    /// Function name at the entry point, `??` when unknown
    pub name: String,
    pub args: Option<String>,
    pub entry_point: u64,
    pub context: u64,
    pub module: u64,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub kernel_type: KernelType,
    pub origin: KernelOrigin,
    /// Nesting level; 0 for host-launched kernels
    pub depth: u32,
    /// The grid has been seen present on the hardware
    pub launched: bool,
    /// Termination was requested while children were alive
    pub zombie: bool,
    pub(crate) grid_status: Cached<GridStatus>,
    pub(crate) disasm_cache: DisasmCache,
}

impl Kernel {
    /// Launch dimensions as `<<<(gx,gy,gz),(bx,by,bz)>>>`.
    pub fn dimensions(&self) -> String {
        format!(
            "<<<({},{},{}),({},{},{})>>>",
            self.grid_dim.x,
            self.grid_dim.y,
            self.grid_dim.z,
            self.block_dim.x,
            self.block_dim.y,
            self.block_dim.z
        )
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    /// Last fetched grid status, if still valid this epoch.
    pub fn cached_grid_status(&self) -> Option<GridStatus> {
        self.grid_status.get().copied()
    }

    pub fn invalidate(&mut self) {
        self.grid_status.invalidate();
    }

    pub fn flush_disasm_cache(&self) {
        self.disasm_cache.flush();
    }
}

/// Arena of kernel records indexed by id and by `(device, grid)`.
#[derive(Debug)]
pub struct KernelRegistry {
    kernels: BTreeMap<KernelId, Kernel>,
    by_grid: HashMap<(u32, GridId), KernelId>,
    next_id: KernelId,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            kernels: BTreeMap::new(),
            by_grid: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn find_by_grid(&self, dev: u32, grid_id: GridId) -> Option<&Kernel> {
        self.by_grid
            .get(&(dev, grid_id))
            .and_then(|id| self.kernels.get(id))
    }

    pub fn find_by_id(&self, id: KernelId) -> Option<&Kernel> {
        self.kernels.get(&id)
    }

    pub(crate) fn find_by_id_mut(&mut self, id: KernelId) -> Option<&mut Kernel> {
        self.kernels.get_mut(&id)
    }

    /// Kernels in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Kernel> {
        self.kernels.values()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Create the record for `info`, or return the existing one for the same
    /// `(device, grid)`. The boolean is true when a record was created.
    pub fn insert(
        &mut self,
        info: &GridInfo,
        name: String,
        parent: Option<KernelId>,
    ) -> (KernelId, bool) {
        if let Some(&id) = self.by_grid.get(&(info.dev, info.grid_id)) {
            return (id, false);
        }

        let parent = parent.filter(|p| self.kernels.contains_key(p));
        let depth = parent
            .and_then(|p| self.kernels.get(&p))
            .map(|p| p.depth + 1)
            .unwrap_or(0);

        let id = self.next_id;
        self.next_id += 1;

        self.kernels.insert(
            id,
            Kernel {
                id,
                dev: info.dev,
                grid_id: info.grid_id,
                parent,
                children: Vec::new(),
                name,
                args: info.args.clone(),
                entry_point: info.function_entry,
                context: info.context,
                module: info.module,
                grid_dim: info.grid_dim,
                block_dim: info.block_dim,
                kernel_type: info.kernel_type,
                origin: info.origin,
                depth,
                launched: false,
                zombie: false,
                grid_status: Cached::new(),
                disasm_cache: DisasmCache::default(),
            },
        );
        self.by_grid.insert((info.dev, info.grid_id), id);
        if let Some(p) = parent.and_then(|p| self.kernels.get_mut(&p)) {
            p.children.push(id);
        }
        (id, true)
    }

    /// Terminate a kernel. Returns the records actually removed: none if the
    /// kernel still has children, otherwise the kernel followed by any zombie
    /// ancestors it was the last child of.
    pub fn terminate(&mut self, id: KernelId) -> Vec<Kernel> {
        let mut removed = Vec::new();
        let mut next = Some(id);

        while let Some(id) = next.take() {
            let Some(kernel) = self.kernels.get_mut(&id) else {
                break;
            };
            if !kernel.children.is_empty() {
                kernel.zombie = true;
                break;
            }
            let Some(kernel) = self.kernels.remove(&id) else {
                break;
            };
            self.by_grid.remove(&(kernel.dev, kernel.grid_id));
            if let Some(parent) = kernel.parent.and_then(|p| self.kernels.get_mut(&p)) {
                parent.children.retain(|&c| c != id);
                if parent.zombie && parent.children.is_empty() {
                    next = Some(parent.id);
                }
            }
            removed.push(kernel);
        }
        removed
    }

    /// Ids of kernels whose code lives in `module`.
    pub fn kernels_in_module(&self, module: u64) -> Vec<KernelId> {
        self.kernels
            .values()
            .filter(|k| k.module == module)
            .map(|k| k.id)
            .collect()
    }

    /// Drop cached grid statuses of the kernels on `dev`.
    pub fn invalidate_device(&mut self, dev: u32) {
        for kernel in self.kernels.values_mut().filter(|k| k.dev == dev) {
            kernel.invalidate();
        }
    }

    pub fn invalidate_all(&mut self) {
        for kernel in self.kernels.values_mut() {
            kernel.invalidate();
        }
    }

    pub fn flush_disasm_caches(&self) {
        for kernel in self.kernels.values() {
            kernel.flush_disasm_cache();
        }
    }

    pub fn clear(&mut self) {
        self.kernels.clear();
        self.by_grid.clear();
    }
}

impl<A: DebugTarget> DebugSession<A> {
    /// Kernel running grid `grid_id` on `dev`, if known.
    pub fn find_kernel_by_grid(&self, dev: u32, grid_id: GridId) -> Option<&Kernel> {
        self.kernels.find_by_grid(dev, grid_id)
    }

    pub fn find_kernel_by_id(&self, id: KernelId) -> Option<&Kernel> {
        self.kernels.find_by_id(id)
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    /// Create (or return) the kernel for a grid, synthesizing unknown
    /// device-side ancestors first.
    pub fn start_kernel(&mut self, info: GridInfo) -> Result<KernelId> {
        if let Some(k) = self.kernels.find_by_grid(info.dev, info.grid_id) {
            return Ok(k.id);
        }

        let mut parent = info
            .parent_grid_id
            .and_then(|p| self.kernels.find_by_grid(info.dev, p))
            .map(|k| k.id);
        if parent.is_none() && info.origin == KernelOrigin::Device {
            parent = self.add_parent_kernel(&info)?;
        }

        let name = self
            .code
            .function_name(info.function_entry)
            .unwrap_or_else(|| "??".to_string());
        let (id, created) = self.kernels.insert(&info, name, parent);
        if created {
            common::log!(self.logs.kernel, "kernel {}: created for device {} grid {}", id, info.dev, info.grid_id);
            if let Some(msg) = self.kernel_event_message("Launch", id) {
                self.say(msg);
            }
        }
        Ok(id)
    }

    /// Kernel for `(dev, grid_id)`, created from the target's grid info when unknown.
    pub fn kernel_for_grid(&mut self, dev: u32, grid_id: GridId) -> Result<KernelId> {
        if let Some(k) = self.kernels.find_by_grid(dev, grid_id) {
            return Ok(k.id);
        }
        let info = self.api.grid_info(dev, grid_id)?;
        self.start_kernel(info)
    }

    /// Synthesize the parent of a device-launched grid from the grid info
    /// already read for the child.
    fn add_parent_kernel(&mut self, child: &GridInfo) -> Result<Option<KernelId>> {
        let Some(parent_grid) = child.parent_grid_id else {
            return Ok(None);
        };
        if self.api.grid_status(child.dev, parent_grid)? == GridStatus::Invalid {
            return Ok(None);
        }
        let parent_info = self.api.grid_info(child.dev, parent_grid)?;
        common::log_detail!(self.logs.kernel, "synthesizing parent grid {} of grid {}", parent_grid, child.grid_id);
        self.start_kernel(parent_info).map(Some)
    }

    /// Terminate a kernel; a no-op while it still has children.
    pub fn terminate_kernel(&mut self, id: KernelId) {
        let removed = self.kernels.terminate(id);
        if removed.is_empty() {
            common::log!(self.logs.kernel, "kernel {}: kept alive by children", id);
        }
        for kernel in removed {
            common::log!(self.logs.kernel, "kernel {}: terminated", kernel.id);
            if self.should_report(&kernel) {
                let msg = format_kernel_event("Termination", &kernel);
                self.say(msg);
            }
        }
    }

    /// Terminate every kernel whose code lives in `module`.
    pub fn terminate_module(&mut self, module: u64) {
        for id in self.kernels.kernels_in_module(module) {
            self.terminate_kernel(id);
        }
    }

    /// Grid status of a kernel, fetched once per epoch.
    pub fn kernel_grid_status(&mut self, id: KernelId) -> Result<GridStatus> {
        let clock = self.clock;
        let api = &self.api;
        let Some(kernel) = self.kernels.find_by_id_mut(id) else {
            return Ok(GridStatus::Invalid);
        };
        let (dev, grid_id) = (kernel.dev, kernel.grid_id);
        let status = kernel
            .grid_status
            .get_or_try_fill(clock, || api.grid_status(dev, grid_id))?;
        Ok(*status)
    }

    /// Whether the kernel's grid is active or sleeping on the hardware.
    pub fn kernel_is_present(&mut self, id: KernelId) -> Result<bool> {
        Ok(self.kernel_grid_status(id)?.is_present())
    }

    /// Reconcile the registry with the hardware after a stop.
    pub fn update_terminated(&mut self) -> Result<()> {
        let ids: Vec<KernelId> = self.kernels.iter().map(|k| k.id).collect();
        for id in ids {
            if self.kernels.find_by_id(id).is_none() {
                // removed by a cascade earlier in this pass
                continue;
            }
            let present = self.kernel_is_present(id)?;
            let launched = match self.kernels.find_by_id_mut(id) {
                Some(kernel) => {
                    if present {
                        kernel.launched = true;
                    }
                    kernel.launched
                }
                None => continue,
            };
            if launched && !present {
                self.terminate_kernel(id);
            }
        }
        Ok(())
    }

    /// SMs currently running at least one warp of the kernel.
    pub fn kernel_sms_mask(&mut self, id: KernelId) -> Result<SmMask> {
        let Some(kernel) = self.kernels.find_by_id(id) else {
            return Ok(SmMask::empty());
        };
        let filter = Coords::wildcard().with_dev(kernel.dev).with_grid(kernel.grid_id);
        let mut iter = CoordIterator::warps(filter, SelectFlags::VALID);
        let mut mask = SmMask::empty();
        iter.start(self)?;
        while let Some(c) = iter.current().copied() {
            if let Some(sm) = c.sm {
                mask.set(sm);
            }
            iter.next(self)?;
        }
        Ok(mask)
    }

    /// Code information for a kernel, with disassembly memoised per kernel.
    pub fn kernel_code(&self, id: Option<KernelId>) -> KernelCode<'_> {
        let cache = id
            .and_then(|id| self.kernels.find_by_id(id))
            .map(|k| &k.disasm_cache);
        KernelCode::new(self.code.as_ref(), cache)
    }

    fn should_report(&self, kernel: &Kernel) -> bool {
        let filter = &self.config.kernel_events;
        if let Some(max) = filter.max_depth {
            if kernel.depth >= max {
                return false;
            }
        }
        match kernel.kernel_type {
            KernelType::Application => filter.application,
            KernelType::System => filter.system,
        }
    }

    fn kernel_event_message(&self, what: &str, id: KernelId) -> Option<String> {
        let kernel = self.kernels.find_by_id(id)?;
        self.should_report(kernel)
            .then(|| format_kernel_event(what, kernel))
    }
}

fn format_kernel_event(what: &str, kernel: &Kernel) -> String {
    format!(
        "[{} of Kernel {} ({}{}) on Device {}, level {}]",
        what,
        kernel.id,
        kernel.name,
        kernel.dimensions(),
        kernel.dev,
        kernel.depth
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(dev: u32, grid_id: GridId, parent: Option<GridId>) -> GridInfo {
        GridInfo {
            dev,
            grid_id,
            function_entry: 0x1000,
            context: 1,
            module: 10,
            grid_dim: Dim3::new(2, 1, 1),
            block_dim: Dim3::new(64, 1, 1),
            kernel_type: KernelType::Application,
            origin: if parent.is_some() { KernelOrigin::Device } else { KernelOrigin::Host },
            parent_grid_id: parent,
            args: None,
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut reg = KernelRegistry::new();
        let (a, created) = reg.insert(&grid(0, 5, None), "k".into(), None);
        assert!(created);
        let (b, created) = reg.insert(&grid(0, 5, None), "k".into(), None);
        assert!(!created);
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);

        // same grid id on another device is a different kernel
        let (c, _) = reg.insert(&grid(1, 5, None), "k".into(), None);
        assert_ne!(a, c);
    }

    #[test]
    fn test_parent_links_and_depth() {
        let mut reg = KernelRegistry::new();
        let (p, _) = reg.insert(&grid(0, 1, None), "parent".into(), None);
        let (c, _) = reg.insert(&grid(0, 2, Some(1)), "child".into(), Some(p));
        let (g, _) = reg.insert(&grid(0, 3, Some(2)), "grandchild".into(), Some(c));
        reg.insert(&grid(0, 2, Some(1)), "child".into(), Some(p));

        assert_eq!(reg.find_by_id(p).unwrap().children, vec![c]);
        assert_eq!(reg.find_by_id(c).unwrap().depth, 1);
        assert_eq!(reg.find_by_id(g).unwrap().depth, 2);
        assert_eq!(reg.find_by_id(g).unwrap().parent, Some(c));
    }

    #[test]
    fn test_zombie_retention() {
        let mut reg = KernelRegistry::new();
        let (p, _) = reg.insert(&grid(0, 1, None), "parent".into(), None);
        let (c1, _) = reg.insert(&grid(0, 2, Some(1)), "c1".into(), Some(p));
        let (c2, _) = reg.insert(&grid(0, 3, Some(1)), "c2".into(), Some(p));

        assert!(reg.terminate(p).is_empty());
        assert!(reg.find_by_grid(0, 1).is_some());
        assert!(reg.find_by_id(p).unwrap().zombie);

        let removed = reg.terminate(c1);
        assert_eq!(removed.len(), 1);
        assert!(reg.find_by_grid(0, 1).is_some());

        let removed: Vec<KernelId> = reg.terminate(c2).iter().map(|k| k.id).collect();
        assert_eq!(removed, vec![c2, p]);
        assert!(reg.find_by_grid(0, 1).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_terminate_without_children_removes() {
        let mut reg = KernelRegistry::new();
        let (p, _) = reg.insert(&grid(0, 1, None), "parent".into(), None);
        let (c, _) = reg.insert(&grid(0, 2, Some(1)), "c".into(), Some(p));
        let removed = reg.terminate(c);
        assert_eq!(removed.len(), 1);
        // a live (non-zombie) parent is not cascaded
        assert!(reg.find_by_id(p).is_some());
        assert_eq!(reg.find_by_id(p).unwrap().num_children(), 0);
        assert!(reg.terminate(42).is_empty());
    }

    #[test]
    fn test_dimensions_string() {
        let mut reg = KernelRegistry::new();
        let (k, _) = reg.insert(&grid(0, 1, None), "k".into(), None);
        assert_eq!(reg.find_by_id(k).unwrap().dimensions(), "<<<(2,1,1),(64,1,1)>>>");
    }

    #[test]
    fn test_kernels_in_module() {
        let mut reg = KernelRegistry::new();
        let (a, _) = reg.insert(&grid(0, 1, None), "a".into(), None);
        let mut other = grid(0, 2, None);
        other.module = 11;
        reg.insert(&other, "b".into(), None);
        assert_eq!(reg.kernels_in_module(10), vec![a]);
    }

    #[test]
    fn test_start_kernel_synthesizes_ancestors() {
        use crate::config::SessionConfig;
        use crate::mock::{grid_info, spec, MockTarget};
        use crate::source_map::SourceMapper;

        let mut target = MockTarget::new(vec![spec(1, 2, 32)]);
        let infos = [grid_info(0, 7, 0x100, None), grid_info(0, 8, 0x100, Some(7)), grid_info(0, 9, 0x100, Some(8))];
        for info in &infos {
            target.add_grid(info.clone(), GridStatus::Active);
        }
        let mut s = DebugSession::open(target, Box::new(SourceMapper::default()), SessionConfig::default()).unwrap();

        let leaf = s.start_kernel(infos[2].clone()).unwrap();
        // only the two ancestors are read from the target
        assert_eq!(s.api().calls("grid_info"), 2);
        assert_eq!(s.kernels().len(), 3);
        let k = s.find_kernel_by_id(leaf).unwrap();
        assert_eq!(k.depth, 2);
        let parent = k.parent.and_then(|p| s.find_kernel_by_id(p)).unwrap();
        assert_eq!(parent.grid_id, 8);
        assert_eq!(s.start_kernel(infos[2].clone()).unwrap(), leaf);
    }
}
