//! Source mapping between device code addresses and source lines

use debuginfo::{DebugInfo, Instruction, LineMapping, LineMappingFlags, Symbol};

/// Source location information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Source file path
    pub file: String,
    /// Line number (1-indexed)
    pub line: u32,
}

/// Disassembly and line-table services the stepping engine relies on.
pub trait CodeInfo {
    /// Source line containing `pc`.
    fn line_for_pc(&self, pc: u64) -> Option<SourceLocation>;

    /// Every address that starts a range mapped to `file:line`.
    fn pcs_for_line(&self, file: &str, line: u32) -> Vec<u64>;

    /// Instruction at `pc`, `None` outside known code.
    fn disassemble(&self, pc: u64) -> Option<Instruction>;

    /// Name of the function containing `pc`.
    fn function_name(&self, pc: u64) -> Option<String>;

    /// `[start, end)` of the function containing `pc`.
    fn function_range(&self, pc: u64) -> Option<(u64, u64)>;

    /// One past the last byte of the function containing `pc`.
    fn function_end(&self, pc: u64) -> Option<u64> {
        self.function_range(pc).map(|(_, end)| end)
    }

    /// Entry address of the named function.
    fn function_address(&self, name: &str) -> Option<u64>;

    /// Address a breakpoint on `file:line` should be planted at.
    fn resolve_line(&self, file: &str, line: u32) -> Option<u64> {
        self.pcs_for_line(file, line).into_iter().min()
    }
}

/// [`CodeInfo`] backed by a loaded [`DebugInfo`].
#[derive(Debug, Clone, Default)]
pub struct SourceMapper {
    info: DebugInfo,
}

impl SourceMapper {
    /// Wrap code information. Line map and instructions must be sorted by address.
    pub fn new(info: DebugInfo) -> Self {
        Self { info }
    }

    /// Get the underlying code information
    pub fn info(&self) -> &DebugInfo {
        &self.info
    }

    /// Find the line mapping for a given address
    fn find_mapping(&self, pc: u64) -> Option<&LineMapping> {
        let idx = self.info.line_map.partition_point(|m| m.address <= pc);
        if idx == 0 {
            return None;
        }
        let mapping = &self.info.line_map[idx - 1];
        // Mappings do not extend past the end of their function
        match self.find_function(mapping.address) {
            Some(f) if !f.contains(pc) => None,
            _ => Some(mapping),
        }
    }

    /// Find the function containing a given address
    fn find_function(&self, pc: u64) -> Option<&Symbol> {
        self.info.symbols.iter().find(|s| s.contains(pc))
    }

    /// Get the code range for a function by name
    pub fn function_code_range(&self, name: &str) -> Option<(u64, u64)> {
        self.info
            .symbols
            .iter()
            .find(|s| s.name == name)
            .map(|s| (s.address, s.end()))
    }
}

impl CodeInfo for SourceMapper {
    fn line_for_pc(&self, pc: u64) -> Option<SourceLocation> {
        let mapping = self.find_mapping(pc)?;
        if mapping.line == 0 {
            return None;
        }
        let source = self.info.sources.iter().find(|s| s.id == mapping.source_id)?;
        Some(SourceLocation {
            file: source.path.clone(),
            line: mapping.line,
        })
    }

    fn pcs_for_line(&self, file: &str, line: u32) -> Vec<u64> {
        let source_id = match self.info.sources.iter().find(|s| s.path == file) {
            Some(s) => s.id,
            None => return Vec::new(),
        };
        self.info
            .line_map
            .iter()
            .filter(|m| m.source_id == source_id && m.line == line)
            .map(|m| m.address)
            .collect()
    }

    fn disassemble(&self, pc: u64) -> Option<Instruction> {
        self.info
            .instructions
            .binary_search_by_key(&pc, |i| i.address)
            .ok()
            .map(|idx| self.info.instructions[idx].clone())
    }

    fn function_name(&self, pc: u64) -> Option<String> {
        self.find_function(pc).map(|s| s.name.clone())
    }

    fn function_range(&self, pc: u64) -> Option<(u64, u64)> {
        self.find_function(pc).map(|s| (s.address, s.end()))
    }

    fn function_address(&self, name: &str) -> Option<u64> {
        self.function_code_range(name).map(|(start, _)| start)
    }

    /// First address mapped to `file:line`, or to the closest following
    /// line. Compiler-generated ranges are never chosen.
    fn resolve_line(&self, file: &str, line: u32) -> Option<u64> {
        let source_id = self
            .info
            .sources
            .iter()
            .find(|s| s.path == file || s.path.ends_with(file))
            .map(|s| s.id)?;

        self.info
            .line_map
            .iter()
            .filter(|m| m.source_id == source_id && m.line >= line)
            .filter(|m| !m.flags.contains(LineMappingFlags::ARTIFICIAL))
            .min_by_key(|m| (m.line, m.address))
            .map(|m| m.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use debuginfo::{DebugInfoBuilder, InstructionFlags, SymbolKind};

    fn sample() -> SourceMapper {
        let mut b = DebugInfoBuilder::new();
        let src = b.add_source("saxpy.cu");
        let f = b.begin_function("saxpy", src, 3, SymbolKind::Kernel);
        b.set_function_code_range(f, 0x100, 0x40);
        b.add_line_mapping(0x100, src, 4, 1, LineMappingFlags::STATEMENT);
        b.add_line_mapping(0x120, src, 5, 1, LineMappingFlags::STATEMENT);
        b.add_line_mapping(0x130, src, 4, 1, LineMappingFlags::empty());
        for (i, flags) in [
            InstructionFlags::empty(),
            InstructionFlags::empty(),
            InstructionFlags::BRANCH,
            InstructionFlags::EXIT,
        ]
        .into_iter()
        .enumerate()
        {
            b.add_instruction(0x100 + 16 * i as u64, 16, "OP", flags, None);
        }
        b.end_function();
        SourceMapper::new(b.build())
    }

    #[test]
    fn test_line_for_pc() {
        let m = sample();
        assert_eq!(m.line_for_pc(0x100).map(|l| l.line), Some(4));
        assert_eq!(m.line_for_pc(0x11f).map(|l| l.line), Some(4));
        assert_eq!(m.line_for_pc(0x120).map(|l| l.line), Some(5));
        assert_eq!(m.line_for_pc(0x13c).map(|l| l.line), Some(4));
        assert_eq!(m.line_for_pc(0x80), None);
        assert_eq!(m.line_for_pc(0x140), None);
    }

    #[test]
    fn test_pcs_for_line() {
        let m = sample();
        assert_eq!(m.pcs_for_line("saxpy.cu", 4), vec![0x100, 0x130]);
        assert!(m.pcs_for_line("other.cu", 4).is_empty());
    }

    #[test]
    fn test_disassemble() {
        let m = sample();
        assert!(m.disassemble(0x120).map(|i| i.is_control_flow()).unwrap_or(false));
        assert!(m.disassemble(0x104).is_none());
    }

    #[test]
    fn test_function_queries() {
        let m = sample();
        assert_eq!(m.function_name(0x110).as_deref(), Some("saxpy"));
        assert_eq!(m.function_end(0x110), Some(0x140));
        assert_eq!(m.function_code_range("saxpy"), Some((0x100, 0x140)));
        assert_eq!(m.function_end(0x200), None);
    }

    #[test]
    fn test_resolve_line() {
        let m = sample();
        assert_eq!(m.resolve_line("saxpy.cu", 5), Some(0x120));
        assert_eq!(m.resolve_line("saxpy.cu", 2), Some(0x100));
        assert_eq!(m.resolve_line("saxpy.cu", 9), None);
    }

    #[test]
    fn test_resolve_line_skips_artificial() {
        let mut b = DebugInfoBuilder::new();
        let src = b.add_source("k.cu");
        let f = b.begin_function("k", src, 1, SymbolKind::Kernel);
        b.set_function_code_range(f, 0, 0x40);
        b.add_line_mapping(0x00, src, 2, 1, LineMappingFlags::ARTIFICIAL);
        b.add_line_mapping(0x20, src, 2, 1, LineMappingFlags::STATEMENT);
        b.end_function();
        let m = SourceMapper::new(b.build());
        assert_eq!(m.resolve_line("k.cu", 2), Some(0x20));
        assert_eq!(m.line_for_pc(0x10).map(|l| l.line), Some(2));
    }
}
