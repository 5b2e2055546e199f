//! Shared binary state: function registry, symbols, sections and size estimation.
//!
//! This module hosts everything that outlives a single function during optimization:
//!
//! - [`BinaryContext`] - the process-wide repository passes run against
//! - [`SymbolTable`] / [`SymbolId`] - interned program symbols with speculative-emission
//!   dirty tracking
//! - [`SectionTable`] / [`BinarySection`] - read-only section contents and relocations
//! - [`SizeEstimator`] - lightweight code-size estimation independent of final emission

mod context;
mod emitter;
mod section;
mod symbol;

pub use context::{BinaryContext, FunctionId, ProgramStats};
pub use emitter::SizeEstimator;
pub use section::{BinarySection, SectionTable};
pub use symbol::{Symbol, SymbolId, SymbolTable};
