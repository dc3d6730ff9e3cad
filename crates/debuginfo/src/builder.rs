//! Code information builder

use crate::types::{
    DebugInfo, Instruction, InstructionFlags, LineMapping, LineMappingFlags, SourceFile, Symbol,
    SymbolKind,
};
use std::collections::HashMap;

/// Builder for constructing DebugInfo
#[derive(Debug, Default)]
pub struct DebugInfoBuilder {
    /// Source files by path
    source_map: HashMap<String, u32>,
    /// Source files in order
    sources: Vec<SourceFile>,
    /// Symbols (kernels and functions)
    symbols: Vec<Symbol>,
    /// Line mappings
    line_map: Vec<LineMapping>,
    /// Instructions
    instructions: Vec<Instruction>,
    /// Current function being built (if any)
    current_func: Option<u32>,
    /// Index of the first instruction added after `begin_function`
    func_insn_start: usize,
}

impl DebugInfoBuilder {
    /// Create a new code info builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source file, returns its ID
    ///
    /// If the source was already added, returns the existing ID.
    pub fn add_source(&mut self, path: &str) -> u32 {
        if let Some(&id) = self.source_map.get(path) {
            return id;
        }

        let id = self.sources.len() as u32;
        self.sources.push(SourceFile {
            id,
            path: path.to_string(),
        });
        self.source_map.insert(path.to_string(), id);
        id
    }

    /// Begin a new function, returns its function ID
    pub fn begin_function(
        &mut self,
        name: &str,
        source_id: u32,
        line: u32,
        kind: SymbolKind,
    ) -> u32 {
        let func_id = self.symbols.len() as u32;
        self.symbols.push(Symbol {
            name: name.to_string(),
            source_id,
            line,
            address: 0,
            size: 0,
            kind,
        });
        self.current_func = Some(func_id);
        self.func_insn_start = self.instructions.len();
        func_id
    }

    /// Set the code range for a function
    pub fn set_function_code_range(&mut self, func_id: u32, address: u64, size: u64) {
        if let Some(sym) = self.symbols.get_mut(func_id as usize) {
            sym.address = address;
            sym.size = size;
        }
    }

    /// Add a line mapping starting at `address`
    pub fn add_line_mapping(
        &mut self,
        address: u64,
        source_id: u32,
        line: u32,
        col: u32,
        flags: LineMappingFlags,
    ) {
        self.line_map.push(LineMapping {
            address,
            source_id,
            line,
            col,
            flags,
        });
    }

    /// Add a decoded instruction
    pub fn add_instruction(
        &mut self,
        address: u64,
        size: u32,
        text: &str,
        flags: InstructionFlags,
        target: Option<u64>,
    ) {
        self.instructions.push(Instruction {
            address,
            size,
            text: text.to_string(),
            flags,
            target,
        });
    }

    /// Finish the current function, growing its range to cover its instructions
    pub fn end_function(&mut self) {
        if let Some(func_id) = self.current_func.take() {
            if let Some(sym) = self.symbols.get_mut(func_id as usize) {
                if sym.size == 0 {
                    let last = self.instructions[self.func_insn_start..]
                        .iter()
                        .filter(|i| i.address >= sym.address)
                        .map(|i| i.next_address())
                        .max();
                    if let Some(last) = last {
                        sym.size = last - sym.address;
                    }
                }
            }
        }
    }

    /// Get the current function ID (if any)
    pub fn current_function(&self) -> Option<u32> {
        self.current_func
    }

    /// Build the final DebugInfo
    ///
    /// Line mappings and instructions are sorted by address.
    pub fn build(mut self) -> DebugInfo {
        self.line_map.sort_by_key(|m| m.address);
        self.instructions.sort_by_key(|i| i.address);
        self.instructions.dedup_by_key(|i| i.address);
        DebugInfo {
            sources: self.sources,
            symbols: self.symbols,
            line_map: self.line_map,
            instructions: self.instructions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_new() {
        let builder = DebugInfoBuilder::new();
        assert!(builder.current_function().is_none());
    }

    #[test]
    fn test_builder_default() {
        let builder = DebugInfoBuilder::default();
        let info = builder.build();
        assert!(info.sources.is_empty());
        assert!(info.symbols.is_empty());
        assert!(info.instructions.is_empty());
    }

    #[test]
    fn test_add_source() {
        let mut builder = DebugInfoBuilder::new();
        let id1 = builder.add_source("saxpy.cu");
        let id2 = builder.add_source("reduce.cu");
        let id3 = builder.add_source("saxpy.cu"); // duplicate

        assert_eq!(id1, 0);
        assert_eq!(id2, 1);
        assert_eq!(id3, 0);

        let info = builder.build();
        assert_eq!(info.sources.len(), 2);
        assert_eq!(info.sources[0].path, "saxpy.cu");
    }

    #[test]
    fn test_begin_function() {
        let mut builder = DebugInfoBuilder::new();
        let source_id = builder.add_source("saxpy.cu");
        let func_id = builder.begin_function("saxpy", source_id, 1, SymbolKind::Kernel);

        assert_eq!(func_id, 0);
        assert_eq!(builder.current_function(), Some(0));

        let info = builder.build();
        assert_eq!(info.symbols.len(), 1);
        assert_eq!(info.symbols[0].name, "saxpy");
        assert_eq!(info.symbols[0].kind, SymbolKind::Kernel);
    }

    #[test]
    fn test_set_function_code_range() {
        let mut builder = DebugInfoBuilder::new();
        let source_id = builder.add_source("saxpy.cu");
        let func_id = builder.begin_function("saxpy", source_id, 1, SymbolKind::Kernel);
        builder.set_function_code_range(func_id, 0x1000, 0x200);

        let info = builder.build();
        assert_eq!(info.symbols[0].address, 0x1000);
        assert_eq!(info.symbols[0].size, 0x200);
    }

    #[test]
    fn test_line_mappings_sorted() {
        let mut builder = DebugInfoBuilder::new();
        let source_id = builder.add_source("saxpy.cu");
        builder.add_line_mapping(0x20, source_id, 5, 3, LineMappingFlags::empty());
        builder.add_line_mapping(0x00, source_id, 4, 1, LineMappingFlags::STATEMENT);

        let info = builder.build();
        assert_eq!(info.line_map.len(), 2);
        assert_eq!(info.line_map[0].address, 0);
        assert_eq!(info.line_map[1].line, 5);
    }

    #[test]
    fn test_end_function_sizes_from_instructions() {
        let mut builder = DebugInfoBuilder::new();
        let source_id = builder.add_source("saxpy.cu");
        let func_id = builder.begin_function("saxpy", source_id, 1, SymbolKind::Kernel);
        builder.set_function_code_range(func_id, 0x100, 0);
        builder.add_instruction(0x100, 16, "MOV R1, c[0x0][0x28]", InstructionFlags::empty(), None);
        builder.add_instruction(0x110, 16, "EXIT", InstructionFlags::EXIT, None);
        builder.end_function();
        assert!(builder.current_function().is_none());

        let info = builder.build();
        assert_eq!(info.symbols[0].size, 0x20);
        assert_eq!(info.instructions.len(), 2);
    }

    #[test]
    fn test_duplicate_instruction_addresses_collapse() {
        let mut builder = DebugInfoBuilder::new();
        builder.add_instruction(0x10, 16, "NOP", InstructionFlags::empty(), None);
        builder.add_instruction(0x00, 16, "NOP", InstructionFlags::empty(), None);
        builder.add_instruction(0x10, 16, "BRA 0x0", InstructionFlags::BRANCH, Some(0));

        let info = builder.build();
        assert_eq!(info.instructions.len(), 2);
        assert_eq!(info.instructions[0].address, 0);
        assert_eq!(info.instructions[1].address, 0x10);
    }

    #[test]
    fn test_multiple_functions() {
        let mut builder = DebugInfoBuilder::new();
        let source_id = builder.add_source("kernels.cu");

        let func1 = builder.begin_function("helper", source_id, 1, SymbolKind::Function);
        builder.set_function_code_range(func1, 0, 0x40);
        builder.end_function();

        let func2 = builder.begin_function("launch", source_id, 10, SymbolKind::Kernel);
        builder.set_function_code_range(func2, 0x40, 0x80);
        builder.end_function();

        let info = builder.build();
        assert_eq!(info.symbols.len(), 2);
        assert_eq!(info.symbols[0].kind, SymbolKind::Function);
        assert_eq!(info.symbols[1].name, "launch");
        assert_eq!(info.symbols[1].kind, SymbolKind::Kernel);
    }
}
