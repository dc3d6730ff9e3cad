//! Device code information
//!
//! This crate describes the loaded device code that a debug session steps
//! through: source files, kernel and function symbols, the address to line
//! table, and the decoded instruction stream with its control-flow flags.
//!
//! The main types are:
//! - [`DebugInfo`] - Complete code information for the loaded modules
//! - [`DebugInfoBuilder`] - Builder for constructing code information

pub mod builder;
pub mod types;

pub use builder::DebugInfoBuilder;
pub use types::{
    DebugInfo, Instruction, InstructionFlags, LineMapping, LineMappingFlags, SourceFile, Symbol,
    SymbolKind,
};
