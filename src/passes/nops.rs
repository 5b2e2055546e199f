//! Padding no-op removal.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    binary::BinaryContext,
    cfg::{AnnotationKind, BinaryFunction, BlockId},
    passes::{run_on_each_function, BinaryPass, SchedulingPolicy},
    Result,
};

/// Strips no-ops that were inserted as removable padding.
///
/// Only instructions both architecturally classified as no-ops and explicitly annotated as
/// insertable padding are removed; alignment no-ops without the annotation stay. Functions
/// can opt out entirely via their preserve-nops flag.
#[derive(Debug, Default)]
pub struct RemoveNops {
    num_removed: AtomicU64,
}

impl RemoveNops {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        RemoveNops::default()
    }

    /// No-ops removed across the run.
    #[must_use]
    pub fn removed(&self) -> u64 {
        self.num_removed.load(Ordering::Relaxed)
    }

    fn run_on_function(&self, function: &mut BinaryFunction, ctx: &BinaryContext) {
        let ids: Vec<BlockId> = function.block_ids().collect();
        for id in ids {
            // Walk backwards so removal does not shift pending indices.
            for idx in (0..function.block(id).instructions().len()).rev() {
                let inst = &function.block(id).instructions()[idx];
                if ctx.isa.is_noop(inst) && inst.annotations.contains(AnnotationKind::NopPadding) {
                    function.block_mut(id).erase_instruction(idx);
                    self.num_removed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

impl BinaryPass for RemoveNops {
    fn name(&self) -> &'static str {
        "remove-nops"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        run_on_each_function(
            ctx,
            SchedulingPolicy::InstLinear,
            |function, ctx| self.run_on_function(function, ctx),
            BinaryFunction::should_preserve_nops,
            self.name(),
        );
        Ok(())
    }
}
