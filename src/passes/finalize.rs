//! Function finalization and in-place size-fit validation.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use crate::{
    binary::BinaryContext,
    cfg::BinaryFunction,
    passes::{run_on_each_function, BinaryPass, SchedulingPolicy},
    Error, Result,
};

/// Freezes every emittable function: reconciles CFI state and recomputes EH ranges.
///
/// A function whose CFI state cannot be reconciled is fatal when the binary is rewritten
/// with relocations (strict mode) - the pipeline aborts naming the function. Without
/// relocations the function is silently demoted to non-optimizable and the original code is
/// kept.
#[derive(Debug, Default)]
pub struct FinalizeFunctions {
    has_fatal: AtomicBool,
    fatal_function: Mutex<Option<String>>,
}

impl FinalizeFunctions {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        FinalizeFunctions::default()
    }

    fn run_on_function(&self, function: &mut BinaryFunction, ctx: &BinaryContext) {
        if !function.finalize_cfi_state() {
            if ctx.has_relocations {
                ctx.sink.error(format_args!(
                    "unable to fix CFI state for function {}. Exiting.",
                    function.name()
                ));
                self.has_fatal.store(true, Ordering::Relaxed);
                if let Ok(mut fatal) = self.fatal_function.lock() {
                    fatal.get_or_insert_with(|| function.name().to_string());
                }
                return;
            }
            function.set_simple(false);
            return;
        }

        function.set_finalized();

        // Update exception handling information.
        function.update_exception_ranges();
    }
}

impl BinaryPass for FinalizeFunctions {
    fn name(&self) -> &'static str {
        "finalize-functions"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        run_on_each_function(
            ctx,
            SchedulingPolicy::Constant,
            |function, ctx| self.run_on_function(function, ctx),
            |function| !ctx.should_emit(function),
            self.name(),
        );

        // Workers finish their current function; the failure surfaces after the barrier.
        if self.has_fatal.load(Ordering::Relaxed) {
            let function = self
                .fatal_function
                .lock()
                .map_err(|_| Error::LockError)?
                .clone()
                .unwrap_or_default();
            return Err(Error::CfiFinalization { function });
        }
        Ok(())
    }
}

/// Demotes functions whose estimated size no longer fits their allocated slot.
///
/// Only meaningful when rewriting in place without relocations: an oversized function cannot
/// be safely overwritten, so it is demoted to non-optimizable instead of corrupting its
/// neighbors. Constant-island padding and size are included in the estimate.
#[derive(Debug, Default)]
pub struct CheckLargeFunctions;

impl CheckLargeFunctions {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        CheckLargeFunctions
    }

    fn offset_to_alignment(address: u64, alignment: u64) -> u64 {
        debug_assert!(alignment > 0);
        (alignment - address % alignment) % alignment
    }
}

impl BinaryPass for CheckLargeFunctions {
    fn name(&self) -> &'static str {
        "check-large-functions"
    }

    // Unlike other passes, functions in non-CFG state are still checked.
    fn should_optimize(&self, function: &BinaryFunction) -> bool {
        function.is_simple() && !function.is_ignored()
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        if ctx.has_relocations {
            return Ok(());
        }

        run_on_each_function(
            ctx,
            SchedulingPolicy::InstLinear,
            |function, ctx| {
                let emitter = ctx.create_independent_emitter();
                let (hot_size, _cold_size) = emitter.estimate_function(function);
                let mut main_fragment_size = hot_size;
                if function.has_islands() {
                    main_fragment_size += Self::offset_to_alignment(
                        function.address() + main_fragment_size,
                        function.island_alignment(),
                    );
                    main_fragment_size += function.island_size();
                }
                if main_fragment_size > function.max_size() {
                    if ctx.opts.print_large_functions {
                        ctx.sink.info(format_args!(
                            "{} size of {main_fragment_size} bytes exceeds allocated space by {} bytes",
                            function.name(),
                            main_fragment_size - function.max_size()
                        ));
                    }
                    function.set_simple(false);
                }
            },
            |function| !self.should_optimize(function),
            self.name(),
        );

        Ok(())
    }
}
