//! Step window computation for bounded stepping
//!
//! These are pure functions over [`CodeInfo`]: given where a warp is and how
//! far it still has to go, they decide how many instructions a single
//! hardware step request may cover, and afterwards measure how much progress
//! the request really made.

use crate::source_map::{CodeInfo, SourceLocation};

/// Unit an autostep length is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepUnit {
    /// Count source line transitions
    Lines,
    /// Count executed instructions
    Instructions,
}

/// Inputs for planning the next step request of a warp
#[derive(Debug, Clone)]
pub struct WindowRequest<'a> {
    /// Current virtual PC of the warp
    pub cur_pc: u64,
    /// Source line at `cur_pc`, if known
    pub cur_line: Option<&'a SourceLocation>,
    /// Lines or instructions still to go
    pub remaining: i64,
    /// Stepping by instruction rather than by line
    pub insn_stepping: bool,
    /// Multi-instruction steps are allowed
    pub optimizations: bool,
    /// The warp is in its kernel's outermost frame
    pub outermost: bool,
    /// Instruction size to assume when the code is not disassemblable
    pub default_inst_size: u32,
}

/// Result of planning a step request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepWindow {
    /// Start of the window
    pub cur_pc: u64,
    /// Exclusive bound the request should not cross
    pub end_pc: u64,
    /// Instructions to request, at least 1
    pub nsteps: u32,
    /// Size of the instruction at `cur_pc`
    pub inst_size: u32,
}

/// Stepping computations
pub struct Stepper;

impl Stepper {
    /// Plan the next step request.
    ///
    /// Returns `None` when the warp already sits at or past the end of its
    /// outermost function, in which case stepping must stop.
    pub fn plan_window(code: &dyn CodeInfo, req: &WindowRequest<'_>) -> Option<StepWindow> {
        let cur_pc = req.cur_pc;
        let inst_size = code
            .disassemble(cur_pc)
            .map(|i| i.size)
            .filter(|&s| s > 0)
            .unwrap_or(req.default_inst_size);
        let remaining = req.remaining.max(0) as u64;

        let mut end_pc = u64::MAX;
        if !req.optimizations {
            end_pc = cur_pc;
        } else if req.insn_stepping || req.cur_line.is_none() {
            end_pc = cur_pc.saturating_add(remaining.saturating_mul(inst_size as u64));
        } else if let Some(loc) = req.cur_line {
            let limit_line = (loc.line as u64 + remaining).min(u32::MAX as u64) as u32;
            for line_pc in code.pcs_for_line(&loc.file, limit_line) {
                if cur_pc < line_pc && line_pc < end_pc {
                    end_pc = line_pc;
                }
            }
        }

        // Never step past the end of the kernel from its outermost frame
        if req.outermost {
            let kernel_end = code
                .function_end(cur_pc)
                .or_else(|| cur_pc.checked_sub(1).and_then(|p| code.function_end(p)))
                .unwrap_or(u64::MAX);
            if cur_pc >= kernel_end {
                return None;
            }
            end_pc = end_pc.min(kernel_end);
        }

        if req.optimizations {
            end_pc = Self::next_control_flow(code, cur_pc, end_pc);
        }

        let nsteps = if end_pc == cur_pc {
            1
        } else {
            Self::count_instructions(code, cur_pc, end_pc)
        };

        Some(StepWindow {
            cur_pc,
            end_pc,
            nsteps: nsteps.max(1),
            inst_size,
        })
    }

    /// Address of the first control-flow instruction in `[pc, end_pc)`, or
    /// `end_pc` if the range is straight-line code.
    ///
    /// Stops early at the first address that cannot be disassembled.
    pub fn next_control_flow(code: &dyn CodeInfo, mut pc: u64, end_pc: u64) -> u64 {
        while pc < end_pc {
            let insn = match code.disassemble(pc) {
                Some(insn) if insn.size > 0 => insn,
                _ => return pc,
            };
            if insn.is_control_flow() {
                return pc;
            }
            pc = insn.next_address();
        }
        end_pc
    }

    /// Number of real instructions in `[pc, end_pc)`.
    ///
    /// Empty slots are skipped and the walk ends at the first address that
    /// cannot be disassembled.
    pub fn count_instructions(code: &dyn CodeInfo, mut pc: u64, end_pc: u64) -> u32 {
        let mut count = 0;
        while pc < end_pc {
            let insn = match code.disassemble(pc) {
                Some(insn) if insn.size > 0 => insn,
                _ => break,
            };
            if !insn.is_empty() {
                count += 1;
            }
            pc = insn.next_address();
        }
        count
    }

    /// Number of line transitions crossed walking `[pc, end_pc]` in
    /// `inst_size` strides. An address without line information counts as a
    /// transition of its own.
    pub fn count_lines(code: &dyn CodeInfo, mut pc: u64, end_pc: u64, inst_size: u32) -> u32 {
        let stride = inst_size.max(1) as u64;
        let mut cur = code.line_for_pc(pc);
        let mut lines = 0;
        while pc <= end_pc {
            let next = code.line_for_pc(pc);
            if Self::lines_differ(cur.as_ref(), next.as_ref()) {
                lines += 1;
            }
            cur = next;
            pc = match pc.checked_add(stride) {
                Some(p) => p,
                None => break,
            };
        }
        lines
    }

    /// Whether two positions are on different lines. Missing line
    /// information always counts as different.
    pub fn lines_differ(a: Option<&SourceLocation>, b: Option<&SourceLocation>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => a.line != b.line,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_map::SourceMapper;
    use debuginfo::{DebugInfoBuilder, InstructionFlags, LineMappingFlags, SymbolKind};

    /// Kernel at 0x0..0x80, 16-byte instructions:
    /// line 10: 0x00 0x10, line 11: 0x20 0x30, line 12: 0x40 (branch), 0x50,
    /// line 13: 0x60, 0x70 (exit)
    fn program() -> SourceMapper {
        let mut b = DebugInfoBuilder::new();
        let src = b.add_source("k.cu");
        let f = b.begin_function("k", src, 9, SymbolKind::Kernel);
        b.set_function_code_range(f, 0, 0x80);
        b.add_line_mapping(0x00, src, 10, 1, LineMappingFlags::STATEMENT);
        b.add_line_mapping(0x20, src, 11, 1, LineMappingFlags::STATEMENT);
        b.add_line_mapping(0x40, src, 12, 1, LineMappingFlags::STATEMENT);
        b.add_line_mapping(0x60, src, 13, 1, LineMappingFlags::STATEMENT);
        for addr in (0..0x80).step_by(16) {
            let flags = match addr {
                0x40 => InstructionFlags::BRANCH,
                0x70 => InstructionFlags::EXIT,
                _ => InstructionFlags::empty(),
            };
            b.add_instruction(addr, 16, "OP", flags, None);
        }
        b.end_function();
        SourceMapper::new(b.build())
    }

    fn req(pc: u64, line: Option<&SourceLocation>, remaining: i64) -> WindowRequest<'_> {
        WindowRequest {
            cur_pc: pc,
            cur_line: line,
            remaining,
            insn_stepping: false,
            optimizations: true,
            outermost: true,
            default_inst_size: 16,
        }
    }

    #[test]
    fn test_line_window_stops_at_control_flow() {
        let code = program();
        // line 13 starts at 0x60 but the branch at 0x40 comes first
        let line = code.line_for_pc(0x00);
        let w = Stepper::plan_window(&code, &req(0x00, line.as_ref(), 3)).unwrap();
        assert_eq!(w.end_pc, 0x40);
        assert_eq!(w.nsteps, 4);
        assert_eq!(w.inst_size, 16);

        let line = code.line_for_pc(0x40);
        let w = Stepper::plan_window(&code, &req(0x40, line.as_ref(), 3)).unwrap();
        assert_eq!(w.end_pc, 0x40);
        assert_eq!(w.nsteps, 1);
    }

    #[test]
    fn test_line_window_without_control_flow() {
        let code = program();
        let line = code.line_for_pc(0x00);
        let w = Stepper::plan_window(&code, &req(0x00, line.as_ref(), 1)).unwrap();
        assert_eq!(w.end_pc, 0x20);
        assert_eq!(w.nsteps, 2);
    }

    #[test]
    fn test_instruction_window() {
        let code = program();
        let r = WindowRequest { insn_stepping: true, ..req(0x50, None, 2) };
        let w = Stepper::plan_window(&code, &r).unwrap();
        assert_eq!(w.end_pc, 0x70);
        assert_eq!(w.nsteps, 2);
    }

    #[test]
    fn test_missing_line_info_uses_instruction_sizes() {
        let code = program();
        let w = Stepper::plan_window(&code, &req(0x00, None, 2)).unwrap();
        assert_eq!(w.end_pc, 0x20);
        assert_eq!(w.nsteps, 2);
    }

    #[test]
    fn test_optimizations_off_steps_one() {
        let code = program();
        let r = WindowRequest { optimizations: false, ..req(0x00, None, 3) };
        let w = Stepper::plan_window(&code, &r).unwrap();
        assert_eq!(w.end_pc, 0x00);
        assert_eq!(w.nsteps, 1);
    }

    #[test]
    fn test_kernel_end_clamp() {
        let code = program();
        let r = WindowRequest { insn_stepping: true, ..req(0x50, None, 100) };
        let w = Stepper::plan_window(&code, &r).unwrap();
        assert!(w.end_pc <= 0x80);
        assert_eq!(w.end_pc, 0x70);

        // Sitting at the kernel end: nothing left to step
        assert!(Stepper::plan_window(&code, &req(0x80, None, 1)).is_none());
    }

    #[test]
    fn test_not_outermost_is_not_clamped() {
        let code = program();
        let r = WindowRequest { outermost: false, optimizations: false, ..req(0x80, None, 1) };
        let w = Stepper::plan_window(&code, &r).unwrap();
        assert_eq!(w.nsteps, 1);
    }

    #[test]
    fn test_count_instructions() {
        let code = program();
        assert_eq!(Stepper::count_instructions(&code, 0x00, 0x40), 4);
        assert_eq!(Stepper::count_instructions(&code, 0x60, u64::MAX), 2);
        assert_eq!(Stepper::count_instructions(&code, 0x40, 0x40), 0);
    }

    #[test]
    fn test_count_lines() {
        let code = program();
        // 0x00..=0x20 crosses 10 -> 11 once
        assert_eq!(Stepper::count_lines(&code, 0x00, 0x20, 16), 1);
        assert_eq!(Stepper::count_lines(&code, 0x00, 0x10, 16), 0);
        assert_eq!(Stepper::count_lines(&code, 0x00, 0x60, 16), 3);
    }

    #[test]
    fn test_lines_differ() {
        let a = SourceLocation { file: "k.cu".into(), line: 3 };
        let b = SourceLocation { file: "k.cu".into(), line: 4 };
        assert!(!Stepper::lines_differ(Some(&a), Some(&a)));
        assert!(Stepper::lines_differ(Some(&a), Some(&b)));
        assert!(Stepper::lines_differ(None, Some(&a)));
    }
}
