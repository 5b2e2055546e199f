//! Ordered pass pipeline execution.

use crate::{
    binary::BinaryContext,
    config::OptConfig,
    passes::{
        BinaryPass, CheckLargeFunctions, CleanEmitterState, EliminateUnreachableBlocks,
        FinalizeFunctions, FixupBranches, InlineMemcpy, NormalizeCfg, Peepholes,
        PrintProgramStats, RemoveNops, ReorderBasicBlocks, ShortenInstructions,
        SimplifyConditionalTailCalls, SimplifyRoDataLoads, SpecializeMemcpy, StripRepRet,
    },
    Result,
};

/// Runs registered passes strictly in order.
///
/// Each pass completes all of its per-function work before the next pass starts (the
/// scheduler does not return until its parallel phase drains), and the first error aborts
/// the pipeline.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn BinaryPass>>,
}

impl PassManager {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        PassManager { passes: Vec::new() }
    }

    /// Builds the standard optimization pipeline.
    ///
    /// Call-site-sensitive passes (memcpy inlining and specialization) run before anything
    /// that inserts or reorders calls, so their per-function call-site enumeration stays
    /// valid. Layout, tail-call simplification and peepholes follow; finalization and the
    /// in-place size check come last.
    #[must_use]
    pub fn standard(opts: &OptConfig) -> Self {
        let mut manager = PassManager::new();
        manager.register(Box::new(PrintProgramStats::new()));
        manager.register(Box::new(NormalizeCfg::new()));
        manager.register(Box::new(EliminateUnreachableBlocks::new()));
        manager.register(Box::new(InlineMemcpy::new()));
        manager.register(Box::new(SpecializeMemcpy::new()));
        manager.register(Box::new(SimplifyRoDataLoads::new()));
        manager.register(Box::new(RemoveNops::new()));
        manager.register(Box::new(ShortenInstructions::new()));
        manager.register(Box::new(ReorderBasicBlocks::new()));
        manager.register(Box::new(FixupBranches::new()));
        manager.register(Box::new(SimplifyConditionalTailCalls::new()));
        if !opts.peepholes.is_empty() {
            manager.register(Box::new(Peepholes::new()));
        }
        manager.register(Box::new(StripRepRet::new()));
        manager.register(Box::new(CleanEmitterState::new()));
        manager.register(Box::new(FinalizeFunctions::new()));
        manager.register(Box::new(CheckLargeFunctions::new()));
        manager
    }

    /// Appends a pass to the pipeline.
    pub fn register(&mut self, pass: Box<dyn BinaryPass>) {
        self.passes.push(pass);
    }

    /// Number of registered passes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    /// Returns `true` if no passes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Runs the pipeline to completion.
    ///
    /// # Errors
    ///
    /// Propagates the first fatal pass error; later passes do not run.
    pub fn run(&self, ctx: &BinaryContext) -> Result<()> {
        for pass in &self.passes {
            if ctx.opts.verbosity > 0 {
                ctx.sink.info(format_args!("starting pass {}", pass.name()));
            }
            pass.run(ctx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PassManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassManager")
            .field("passes", &self.passes.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test::{test_context, FunctionBuilder},
        Error,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPass {
        order: &'static AtomicUsize,
        expected: usize,
        fail: bool,
    }

    impl BinaryPass for CountingPass {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run(&self, _ctx: &BinaryContext) -> Result<()> {
            let seen = self.order.fetch_add(1, Ordering::SeqCst);
            assert_eq!(seen, self.expected, "passes ran out of order");
            if self.fail {
                return Err(Error::Error("boom".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_passes_run_in_registration_order_and_stop_on_error() {
        static ORDER: AtomicUsize = AtomicUsize::new(0);

        let ctx = test_context();
        FunctionBuilder::new("f", 0x1000).block(|b| b.ret()).build_into(&ctx);

        let mut manager = PassManager::new();
        manager.register(Box::new(CountingPass { order: &ORDER, expected: 0, fail: false }));
        manager.register(Box::new(CountingPass { order: &ORDER, expected: 1, fail: true }));
        manager.register(Box::new(CountingPass { order: &ORDER, expected: 99, fail: false }));

        assert!(manager.run(&ctx).is_err());
        assert_eq!(ORDER.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_standard_pipeline_composition() {
        let manager = PassManager::standard(&crate::config::OptConfig::default());
        assert!(!manager.is_empty());
        // Default flags disable peepholes, the rest of the pipeline is always present.
        assert_eq!(manager.len(), 15);
    }
}
