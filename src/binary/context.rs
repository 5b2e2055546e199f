//! Process-wide binary context: the function registry and shared services.
//!
//! The [`BinaryContext`] is the single repository every pass runs against. Per-function
//! mutation uses a checkout discipline: a worker removes the function from the registry,
//! mutates it with no locks held, and reinserts it. No two workers ever hold the same
//! function within one pass, which is what makes the per-function work embarrassingly
//! parallel.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::{
    binary::{BinarySection, SectionTable, SizeEstimator, SymbolId, SymbolTable},
    cfg::BinaryFunction,
    config::OptConfig,
    isa::InstructionSemantics,
    report::ReportSink,
};

/// Stable identifier of a function in the registry (its input address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u64);

/// Program-wide profile statistics, filled in by the reporting pass and read by summaries.
#[derive(Debug, Default)]
pub struct ProgramStats {
    /// Functions with a valid execution profile.
    pub num_profiled_funcs: AtomicUsize,
    /// Functions whose profile is stale.
    pub num_stale_profile_funcs: AtomicUsize,
}

/// Shared repository of all functions, sections, symbols and services.
pub struct BinaryContext {
    functions: DashMap<FunctionId, BinaryFunction>,
    /// Global symbol table.
    pub symbols: SymbolTable,
    /// Section contents and relocation addresses.
    pub sections: SectionTable,
    /// Architecture-specific instruction semantics.
    pub isa: Box<dyn InstructionSemantics>,
    /// Pipeline configuration.
    pub opts: OptConfig,
    /// Ordered text output for statistics.
    pub sink: ReportSink,
    /// Whether the binary is rewritten with relocations (strict mode).
    pub has_relocations: bool,
    /// Program-wide profile statistics.
    pub stats: ProgramStats,
}

impl BinaryContext {
    /// Creates a context over the given target layer and configuration.
    #[must_use]
    pub fn new(isa: Box<dyn InstructionSemantics>, opts: OptConfig) -> Self {
        BinaryContext {
            functions: DashMap::new(),
            symbols: SymbolTable::new(),
            sections: SectionTable::new(),
            isa,
            opts,
            sink: ReportSink::stdout(),
            has_relocations: false,
            stats: ProgramStats::default(),
        }
    }

    /// Replaces the report sink.
    pub fn set_sink(&mut self, sink: ReportSink) {
        self.sink = sink;
    }

    // ── Function registry ───────────────────────────────────────────────

    /// Registers a function, keyed by its input address.
    ///
    /// The function's entry symbol is interned on the way in.
    pub fn add_function(&self, function: BinaryFunction) -> FunctionId {
        let id = FunctionId(function.address());
        self.symbols
            .intern(function.name(), Some(function.address()));
        self.functions.insert(id, function);
        id
    }

    /// Returns all function ids, sorted by address for deterministic iteration.
    #[must_use]
    pub fn function_ids(&self) -> Vec<FunctionId> {
        let mut ids: Vec<FunctionId> = self.functions.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of registered functions.
    #[must_use]
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Runs a closure with shared access to a function.
    pub fn with_function<R, F>(&self, id: FunctionId, f: F) -> Option<R>
    where
        F: FnOnce(&BinaryFunction) -> R,
    {
        self.functions.get(&id).map(|entry| f(&entry))
    }

    /// Runs a closure with exclusive access to a function.
    ///
    /// The function is checked out of the registry for the duration of the closure (brief
    /// lock, then released), so the closure runs with no registry locks held and may use the
    /// context's other services freely.
    pub fn with_function_mut<R, F>(&self, id: FunctionId, f: F) -> Option<R>
    where
        F: FnOnce(&mut BinaryFunction) -> R,
    {
        let (_, mut function) = self.functions.remove(&id)?;
        let result = f(&mut function);
        self.functions.insert(id, function);
        Some(result)
    }

    /// Returns `true` if the function will be emitted into the output binary.
    #[must_use]
    pub fn should_emit(&self, function: &BinaryFunction) -> bool {
        !function.is_ignored() && function.is_simple()
    }

    // ── Services ────────────────────────────────────────────────────────

    /// Creates a fresh, independent size estimator.
    ///
    /// Callers measuring throwaway code must use a fresh instance per measurement so shared
    /// emitter state cannot be corrupted by concurrent estimation.
    #[must_use]
    pub fn create_independent_emitter(&self) -> SizeEstimator<'_> {
        SizeEstimator::new(&self.symbols)
    }

    /// Interns a symbol by name.
    pub fn intern_symbol(&self, name: &str, address: Option<u64>) -> SymbolId {
        self.symbols.intern(name, address)
    }

    /// Returns the address behind a symbol, looking through the symbol table.
    #[must_use]
    pub fn symbol_address(&self, id: SymbolId) -> Option<u64> {
        self.symbols.address(id)
    }

    /// Adds a section to the section table.
    pub fn add_section(&mut self, section: BinarySection) {
        self.sections.add_section(section);
    }

    /// Total number of profiled functions (valid + stale), for percentage reporting.
    #[must_use]
    pub fn all_profiled_functions(&self) -> usize {
        self.stats.num_profiled_funcs.load(Ordering::Relaxed)
            + self.stats.num_stale_profile_funcs.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BinaryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryContext")
            .field("functions", &self.functions.len())
            .field("has_relocations", &self.has_relocations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::X64;

    fn context() -> BinaryContext {
        let mut ctx = BinaryContext::new(Box::new(X64::new()), OptConfig::default());
        ctx.set_sink(ReportSink::sink());
        ctx
    }

    #[test]
    fn test_function_checkout_roundtrip() {
        let ctx = context();
        let id = ctx.add_function(BinaryFunction::new("main", 0x1000));

        let renamed = ctx.with_function_mut(id, |f| {
            f.set_simple(false);
            f.name().to_string()
        });
        assert_eq!(renamed.as_deref(), Some("main"));
        assert_eq!(ctx.with_function(id, |f| f.is_simple()), Some(false));
    }

    #[test]
    fn test_function_ids_sorted_by_address() {
        let ctx = context();
        ctx.add_function(BinaryFunction::new("b", 0x2000));
        ctx.add_function(BinaryFunction::new("a", 0x1000));
        assert_eq!(
            ctx.function_ids(),
            vec![FunctionId(0x1000), FunctionId(0x2000)]
        );
    }

    #[test]
    fn test_entry_symbol_interned() {
        let ctx = context();
        ctx.add_function(BinaryFunction::new("main", 0x1000));
        let sym = ctx.symbols.lookup("main").unwrap();
        assert_eq!(ctx.symbol_address(sym), Some(0x1000));
    }
}
