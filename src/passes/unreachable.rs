//! Unreachable-block elimination.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;

use crate::{
    binary::{BinaryContext, FunctionId},
    cfg::BinaryFunction,
    passes::{run_on_each_function, BinaryPass, SchedulingPolicy},
    Result,
};

/// Erases every block with no path from an entry point or landing pad.
///
/// Reachability is computed mark-and-sweep from the entry blocks; the bytes of removed code
/// are measured on a fresh, independent size emitter so concurrent estimation cannot corrupt
/// shared assembler state.
#[derive(Debug, Default)]
pub struct EliminateUnreachableBlocks {
    deleted_blocks: AtomicU64,
    deleted_bytes: AtomicU64,
    modified: DashSet<FunctionId>,
}

impl EliminateUnreachableBlocks {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        EliminateUnreachableBlocks::default()
    }

    /// Functions whose CFG was changed by this pass.
    #[must_use]
    pub fn modified(&self) -> &DashSet<FunctionId> {
        &self.modified
    }

    /// Total blocks deleted across the run.
    #[must_use]
    pub fn deleted_blocks(&self) -> u64 {
        self.deleted_blocks.load(Ordering::Relaxed)
    }

    fn run_on_function(&self, function: &mut BinaryFunction, ctx: &BinaryContext) {
        function.mark_unreachable_blocks();

        let mut emitter = ctx.create_independent_emitter();
        let (count, bytes) = function.erase_invalid_blocks(Some(&mut emitter));

        self.deleted_blocks.fetch_add(count as u64, Ordering::Relaxed);
        self.deleted_bytes.fetch_add(bytes, Ordering::Relaxed);

        if count > 0 {
            self.modified.insert(FunctionId(function.address()));
            if ctx.opts.verbosity > 0 {
                ctx.sink.info(format_args!(
                    "removed {count} dead basic block(s) accounting for {bytes} bytes in function {}",
                    function.name()
                ));
            }
        }
    }
}

impl BinaryPass for EliminateUnreachableBlocks {
    fn name(&self) -> &'static str {
        "eliminate-unreachable"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        run_on_each_function(
            ctx,
            SchedulingPolicy::Constant,
            |function, ctx| self.run_on_function(function, ctx),
            |function| !self.should_optimize(function) || function.layout().block_empty(),
            self.name(),
        );

        let blocks = self.deleted_blocks.load(Ordering::Relaxed);
        if blocks > 0 {
            ctx.sink.info(format_args!(
                "UCE removed {blocks} blocks and {} bytes of code",
                self.deleted_bytes.load(Ordering::Relaxed)
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cfg::BlockId,
        test::{test_context, FunctionBuilder},
    };

    #[test]
    fn test_unreachable_blocks_are_erased_and_counted() {
        let ctx = test_context();
        let id = FunctionBuilder::new("dead-code", 0x1000)
            .block(|b| b.jump(1))
            .block(|b| b.ret())
            .block(|b| b.push_nop().jump(3)) // unreachable chain
            .block(|b| b.ret())
            .build_into(&ctx);

        let pass = EliminateUnreachableBlocks::new();
        pass.run(&ctx).unwrap();

        assert_eq!(pass.deleted_blocks(), 2);
        assert!(pass.deleted_bytes.load(Ordering::Relaxed) > 0);
        assert!(pass.modified().contains(&id));
        ctx.with_function(id, |f| {
            assert!(f.block(BlockId::new(2)).is_erased());
            assert!(f.block(BlockId::new(3)).is_erased());
            assert!(f.validate_cfg());
        });
    }

    #[test]
    fn test_landing_pads_are_roots() {
        let ctx = test_context();
        let id = FunctionBuilder::new("eh", 0x1000)
            .block(|b| b.jump(1))
            .block(|b| b.ret())
            .block(|b| b.landing_pad().ret())
            .build_into(&ctx);

        let pass = EliminateUnreachableBlocks::new();
        pass.run(&ctx).unwrap();

        assert_eq!(pass.deleted_blocks(), 0);
        ctx.with_function(id, |f| {
            assert!(!f.block(BlockId::new(2)).is_erased());
        });
    }

    #[test]
    fn test_untouched_function_not_reported_modified() {
        let ctx = test_context();
        let id = FunctionBuilder::new("clean", 0x1000)
            .block(|b| b.ret())
            .build_into(&ctx);

        let pass = EliminateUnreachableBlocks::new();
        pass.run(&ctx).unwrap();
        assert!(!pass.modified().contains(&id));
    }
}
