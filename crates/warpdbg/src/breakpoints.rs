//! Breakpoint management
//!
//! The session only needs to know where breakpoints are, whether they are
//! enabled, and which of them carry an autostep length. Planting them in
//! device code is the host debugger's job.

use crate::source_map::CodeInfo;
use crate::stepping::StepUnit;
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a breakpoint was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakLocation {
    /// Source file and line
    Line {
        /// Source file path or suffix
        file: String,
        /// Line number (1-indexed)
        line: u32,
    },
    /// Function entry
    Function(String),
    /// Raw address
    Address(u64),
}

impl fmt::Display for BreakLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakLocation::Line { file, line } => write!(f, "{}:{}", file, line),
            BreakLocation::Function(name) => write!(f, "{}", name),
            BreakLocation::Address(addr) => write!(f, "*0x{:x}", addr),
        }
    }
}

/// Length of an autostep region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutostepLength {
    /// Number of lines or instructions
    pub count: u32,
    /// What `count` counts
    pub unit: StepUnit,
}

impl AutostepLength {
    pub fn lines(count: u32) -> Self {
        Self { count, unit: StepUnit::Lines }
    }

    pub fn instructions(count: u32) -> Self {
        Self { count, unit: StepUnit::Instructions }
    }
}

/// A breakpoint in the debugger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Unique identifier
    pub id: BreakpointId,
    /// Requested location
    pub location: BreakLocation,
    /// Resolved address
    pub address: u64,
    /// Whether the breakpoint is enabled
    pub enabled: bool,
    /// Number of times this breakpoint has been hit
    pub hit_count: u32,
    /// Autostep region starting at this breakpoint
    pub autostep: Option<AutostepLength>,
}

impl Breakpoint {
    pub fn is_autostep(&self) -> bool {
        self.autostep.is_some()
    }
}

/// Breakpoint table
#[derive(Debug, Default)]
pub struct BreakpointManager {
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    next_id: u32,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self { breakpoints: BTreeMap::new(), next_id: 1 }
    }

    /// Resolve a location to an address
    pub fn resolve(code: &dyn CodeInfo, location: &BreakLocation) -> Option<u64> {
        match location {
            BreakLocation::Line { file, line } => code.resolve_line(file, *line),
            BreakLocation::Function(name) => code.function_address(name),
            BreakLocation::Address(addr) => Some(*addr),
        }
    }

    /// Add an enabled breakpoint at a resolved address
    pub fn insert(
        &mut self,
        location: BreakLocation,
        address: u64,
        autostep: Option<AutostepLength>,
    ) -> BreakpointId {
        let id = BreakpointId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                location,
                address,
                enabled: true,
                hit_count: 0,
                autostep,
            },
        );
        id
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Enabled autostep breakpoint at `addr`. Disabled ones neither start
    /// nor extend a region.
    pub fn find_autostep_by_addr(&self, addr: u64) -> Option<&Breakpoint> {
        self.breakpoints
            .values()
            .find(|bp| bp.enabled && bp.address == addr && bp.is_autostep())
    }

    /// Check if any enabled breakpoint is hit at the given address
    pub fn check_breakpoint(&self, addr: u64) -> Option<BreakpointId> {
        self.breakpoints
            .values()
            .find(|bp| bp.enabled && bp.address == addr)
            .map(|bp| bp.id)
    }

    /// Record a hit on a breakpoint
    pub fn record_hit(&mut self, id: BreakpointId) {
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.hit_count += 1;
        }
    }

    /// Enable a breakpoint
    pub fn enable(&mut self, id: BreakpointId) -> bool {
        self.set_enabled(id, true)
    }

    /// Disable a breakpoint
    pub fn disable(&mut self, id: BreakpointId) -> bool {
        self.set_enabled(id, false)
    }

    fn set_enabled(&mut self, id: BreakpointId, enabled: bool) -> bool {
        match self.breakpoints.get_mut(&id) {
            Some(bp) => {
                bp.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Delete a breakpoint
    pub fn delete(&mut self, id: BreakpointId) -> Option<Breakpoint> {
        self.breakpoints.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_map::SourceMapper;
    use debuginfo::{DebugInfoBuilder, LineMappingFlags, SymbolKind};

    fn make_code() -> SourceMapper {
        let mut b = DebugInfoBuilder::new();
        let src = b.add_source("src/reduce.cu");
        let f = b.begin_function("reduce", src, 1, SymbolKind::Kernel);
        b.set_function_code_range(f, 0x400, 0x100);
        b.add_line_mapping(0x400, src, 2, 1, LineMappingFlags::STATEMENT);
        b.add_line_mapping(0x440, src, 4, 1, LineMappingFlags::STATEMENT);
        b.end_function();
        SourceMapper::new(b.build())
    }

    #[test]
    fn test_resolve_locations() {
        let code = make_code();
        let line = BreakLocation::Line { file: "reduce.cu".into(), line: 3 };
        assert_eq!(BreakpointManager::resolve(&code, &line), Some(0x440));
        let func = BreakLocation::Function("reduce".into());
        assert_eq!(BreakpointManager::resolve(&code, &func), Some(0x400));
        assert_eq!(BreakpointManager::resolve(&code, &BreakLocation::Address(7)), Some(7));
        let missing = BreakLocation::Function("scan".into());
        assert_eq!(BreakpointManager::resolve(&code, &missing), None);
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut bps = BreakpointManager::new();
        let a = bps.insert(BreakLocation::Address(0x10), 0x10, None);
        let b = bps.insert(BreakLocation::Address(0x20), 0x20, None);
        assert_eq!(a, BreakpointId(1));
        assert_eq!(b, BreakpointId(2));
        bps.delete(a);
        let c = bps.insert(BreakLocation::Address(0x30), 0x30, None);
        assert_eq!(c, BreakpointId(3));
        assert_eq!(bps.len(), 2);
    }

    #[test]
    fn test_find_autostep_by_addr() {
        let mut bps = BreakpointManager::new();
        bps.insert(BreakLocation::Address(0x10), 0x10, None);
        let astep = bps.insert(BreakLocation::Address(0x20), 0x20, Some(AutostepLength::lines(3)));

        assert!(bps.find_autostep_by_addr(0x10).is_none());
        assert_eq!(bps.find_autostep_by_addr(0x20).map(|bp| bp.id), Some(astep));

        bps.disable(astep);
        assert!(bps.find_autostep_by_addr(0x20).is_none());
        assert_eq!(bps.check_breakpoint(0x20), None);

        // An enabled autostep sharing the address is still found
        let other = bps.insert(BreakLocation::Address(0x20), 0x20, Some(AutostepLength::instructions(1)));
        assert_eq!(bps.find_autostep_by_addr(0x20).map(|bp| bp.id), Some(other));
    }

    #[test]
    fn test_enable_disable_record_hit() {
        let mut bps = BreakpointManager::new();
        let id = bps.insert(BreakLocation::Address(0x10), 0x10, None);
        assert!(bps.disable(id));
        assert!(!bps.get(id).unwrap().enabled);
        assert!(bps.enable(id));
        assert_eq!(bps.check_breakpoint(0x10), Some(id));
        bps.record_hit(id);
        bps.record_hit(id);
        assert_eq!(bps.get(id).unwrap().hit_count, 2);
        assert!(!bps.enable(BreakpointId(99)));
    }

    #[test]
    fn test_location_display() {
        assert_eq!(BreakLocation::Line { file: "a.cu".into(), line: 4 }.to_string(), "a.cu:4");
        assert_eq!(BreakLocation::Address(0x1f).to_string(), "*0x1f");
    }
}
