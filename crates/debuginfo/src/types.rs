//! Device code information types

/// Complete code information for the device programs loaded in a session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DebugInfo {
    /// Source files referenced by the line table
    pub sources: Vec<SourceFile>,
    /// Symbol table (kernels and device functions)
    pub symbols: Vec<Symbol>,
    /// Line number mappings
    pub line_map: Vec<LineMapping>,
    /// Decoded instructions, one entry per instruction address
    pub instructions: Vec<Instruction>,
}

/// A source file referenced in the line table
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    /// Unique ID for this source (index in sources array)
    pub id: u32,
    /// Path or identifier for the source
    pub path: String,
}

/// A symbol (kernel or device function) in the code information
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    /// Function/symbol name
    pub name: String,
    /// Source file ID
    pub source_id: u32,
    /// Start line in source
    pub line: u32,
    /// Virtual address of the first instruction
    pub address: u64,
    /// Size of generated code in bytes
    pub size: u64,
    /// Symbol kind
    pub kind: SymbolKind,
}

impl Symbol {
    /// One past the last byte of the symbol's code
    pub fn end(&self) -> u64 {
        self.address + self.size
    }

    /// Whether `addr` falls inside the symbol's code
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.end()
    }
}

/// Kind of symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Kernel entry point (launchable grid function)
    Kernel,
    /// Device function called from a kernel
    Function,
}

/// Mapping from an instruction address to a source location
#[derive(Debug, Clone, PartialEq)]
pub struct LineMapping {
    /// Virtual address where this mapping starts
    pub address: u64,
    /// Source file ID
    pub source_id: u32,
    /// Line number (1-based)
    pub line: u32,
    /// Column number (1-based)
    pub col: u32,
    /// Flags for this mapping
    pub flags: LineMappingFlags,
}

bitflags::bitflags! {
    /// Flags for line mappings
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LineMappingFlags: u8 {
        /// Start of a source statement
        const STATEMENT = 0b0000_0001;
        /// Compiler-generated code with no statement of its own
        const ARTIFICIAL = 0b0000_0010;
    }
}

/// A decoded device instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Virtual address of the instruction
    pub address: u64,
    /// Encoded size in bytes
    pub size: u32,
    /// Disassembled text; empty for padding slots
    pub text: String,
    /// Control-flow classification
    pub flags: InstructionFlags,
    /// Destination of a branch or call, when statically known
    pub target: Option<u64>,
}

impl Instruction {
    /// Whether the instruction may transfer control somewhere other than the next address
    pub fn is_control_flow(&self) -> bool {
        self.flags.intersects(InstructionFlags::CONTROL_FLOW)
    }

    /// Whether the slot holds no real instruction
    pub fn is_empty(&self) -> bool {
        self.flags.contains(InstructionFlags::EMPTY) || self.text.is_empty()
    }

    /// Address of the following instruction slot
    pub fn next_address(&self) -> u64 {
        self.address + self.size as u64
    }
}

bitflags::bitflags! {
    /// Instruction classification used by stepping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstructionFlags: u8 {
        /// Conditional or unconditional branch
        const BRANCH = 0b0000_0001;
        /// Function call
        const CALL = 0b0000_0010;
        /// Function return
        const RETURN = 0b0000_0100;
        /// Thread exit
        const EXIT = 0b0000_1000;
        /// Warp-synchronous barrier or reconvergence point
        const BARRIER = 0b0001_0000;
        /// Padding slot, not counted as an executed instruction
        const EMPTY = 0b0010_0000;
        /// Faults when executed
        const TRAP = 0b0100_0000;
        /// Any instruction that ends straight-line execution
        const CONTROL_FLOW = Self::BRANCH.bits()
            | Self::CALL.bits()
            | Self::RETURN.bits()
            | Self::EXIT.bits()
            | Self::BARRIER.bits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_info_default() {
        let info = DebugInfo::default();
        assert!(info.sources.is_empty());
        assert!(info.symbols.is_empty());
        assert!(info.line_map.is_empty());
        assert!(info.instructions.is_empty());
    }

    #[test]
    fn test_symbol_range() {
        let sym = Symbol {
            name: "saxpy".to_string(),
            source_id: 0,
            line: 3,
            address: 0x1000,
            size: 0x80,
            kind: SymbolKind::Kernel,
        };
        assert_eq!(sym.end(), 0x1080);
        assert!(sym.contains(0x1000));
        assert!(sym.contains(0x107f));
        assert!(!sym.contains(0x1080));
        assert!(!sym.contains(0xfff));
    }

    #[test]
    fn test_control_flow_classification() {
        let mut insn = Instruction {
            address: 0x20,
            size: 16,
            text: "BRA 0x60".to_string(),
            flags: InstructionFlags::BRANCH,
            target: Some(0x60),
        };
        assert!(insn.is_control_flow());
        assert!(!insn.is_empty());
        assert_eq!(insn.next_address(), 0x30);

        insn.flags = InstructionFlags::TRAP;
        assert!(!insn.is_control_flow());

        insn.flags = InstructionFlags::BARRIER;
        assert!(insn.is_control_flow());
    }

    #[test]
    fn test_empty_slot() {
        let insn = Instruction {
            address: 0,
            size: 16,
            text: String::new(),
            flags: InstructionFlags::empty(),
            target: None,
        };
        assert!(insn.is_empty());
    }
}
