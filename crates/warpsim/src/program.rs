//! Device code described by a scenario
//!
//! Every instruction slot of a declared function is a `NOP` unless the
//! scenario describes it; later descriptions of a slot replace earlier ones.

use debuginfo::{DebugInfo, DebugInfoBuilder, InstructionFlags, LineMappingFlags, SymbolKind};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct FunctionDef {
    name: String,
    file: String,
    line: u32,
    start: u64,
    end: u64,
    kind: SymbolKind,
    lines: BTreeMap<u64, u32>,
    insns: BTreeMap<u64, (String, InstructionFlags, Option<u64>)>,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    functions: Vec<FunctionDef>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn function(&mut self, name: &str, file: &str, line: u32, start: u64, end: u64, kind: SymbolKind) {
        self.functions.push(FunctionDef {
            name: name.to_string(),
            file: file.to_string(),
            line,
            start,
            end,
            kind,
            lines: BTreeMap::new(),
            insns: BTreeMap::new(),
        });
    }

    fn owner(&mut self, addr: u64) -> Result<&mut FunctionDef, String> {
        self.functions
            .iter_mut()
            .find(|f| f.start <= addr && addr < f.end)
            .ok_or_else(|| format!("0x{:x} is outside every function", addr))
    }

    pub fn line(&mut self, addr: u64, line: u32) -> Result<(), String> {
        self.owner(addr)?.lines.insert(addr, line);
        Ok(())
    }

    pub fn insn(&mut self, addr: u64, text: String, flags: InstructionFlags, target: Option<u64>)
        -> Result<(), String> {
        self.owner(addr)?.insns.insert(addr, (text, flags, target));
        Ok(())
    }

    /// Build the code information, filling undescribed slots of
    /// `inst_size` bytes with `NOP`s.
    pub fn build(&self, inst_size: u32) -> DebugInfo {
        let mut b = DebugInfoBuilder::new();
        let step = inst_size.max(1) as usize;
        for f in &self.functions {
            let src = b.add_source(&f.file);
            let id = b.begin_function(&f.name, src, f.line, f.kind);
            b.set_function_code_range(id, f.start, f.end - f.start);
            for (&addr, &line) in &f.lines {
                b.add_line_mapping(addr, src, line, 1, LineMappingFlags::STATEMENT);
            }
            for addr in (f.start..f.end).step_by(step) {
                match f.insns.get(&addr) {
                    Some((text, flags, target)) => b.add_instruction(addr, inst_size, text, *flags, *target),
                    None => b.add_instruction(addr, inst_size, "NOP", InstructionFlags::empty(), None),
                }
            }
            b.end_function();
        }
        b.build()
    }
}
