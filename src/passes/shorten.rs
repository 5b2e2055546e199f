//! Instruction shortening.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    binary::BinaryContext,
    cfg::{AnnotationKind, BinaryFunction, BlockId},
    passes::{run_on_each_function, BinaryPass, SchedulingPolicy},
    Result,
};

/// Replaces instructions with equivalent shorter encodings where the target layer supports
/// it. Instructions carrying an explicit size override annotation are never touched.
#[derive(Debug, Default)]
pub struct ShortenInstructions {
    num_shortened: AtomicU64,
}

impl ShortenInstructions {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        ShortenInstructions::default()
    }

    /// Instructions shortened across the run.
    #[must_use]
    pub fn shortened(&self) -> u64 {
        self.num_shortened.load(Ordering::Relaxed)
    }

    fn run_on_function(&self, function: &mut BinaryFunction, ctx: &BinaryContext) {
        let mut count = 0u64;
        let ids: Vec<BlockId> = function.block_ids().collect();
        for id in ids {
            let len = function.block(id).instructions().len();
            for idx in 0..len {
                // Skip shortening instructions with an explicit size annotation.
                if function.block(id).instructions()[idx]
                    .annotations
                    .contains(AnnotationKind::Size)
                {
                    continue;
                }

                let original = if ctx.opts.verbosity > 2 {
                    Some(function.block(id).instructions()[idx].clone())
                } else {
                    None
                };

                if !ctx
                    .isa
                    .shorten_instruction(&mut function.block_mut(id).instructions_mut()[idx])
                {
                    continue;
                }

                if let Some(original) = original {
                    ctx.sink.info(format_args!(
                        "shortening: {original:?} to: {:?}",
                        function.block(id).instructions()[idx]
                    ));
                }
                count += 1;
            }
        }
        self.num_shortened.fetch_add(count, Ordering::Relaxed);
    }
}

impl BinaryPass for ShortenInstructions {
    fn name(&self) -> &'static str {
        "shorten-instructions"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        if !ctx.isa.supports_instruction_shortening() {
            return Ok(());
        }

        run_on_each_function(
            ctx,
            SchedulingPolicy::InstLinear,
            |function, ctx| self.run_on_function(function, ctx),
            |_| false,
            self.name(),
        );

        let shortened = self.num_shortened.load(Ordering::Relaxed);
        if shortened > 0 {
            ctx.sink
                .info(format_args!("{shortened} instructions were shortened"));
        }
        Ok(())
    }
}
