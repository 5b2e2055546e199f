//! CFG normalization: empty-block removal and duplicate-edge repair.
//!
//! Run early, before any layout or rewriting pass, so downstream passes see a CFG without
//! dangling empty blocks or duplicate conditional edges.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    binary::BinaryContext,
    cfg::{BinaryFunction, BlockId},
    passes::{run_on_each_function, BinaryPass, SchedulingPolicy},
    Result,
};

/// Removes empty blocks and merges duplicate CFG edges.
///
/// For each empty, non-entry, non-landing-pad block:
///
/// - with no successors and no predecessors, the block is dangling and removed. An empty
///   dangling block that still has predecessors can be the result of codegen for
///   `__builtin_unreachable` and is kept;
/// - with exactly one successor, every predecessor is redirected directly to that successor,
///   carrying its branch weight along - unless the predecessor dispatches through a jump
///   table (indirect targets are never retargeted this way) or already targets the successor.
///
/// Afterwards, blocks whose two conditional successors point at the same target are counted
/// and branch repair is triggered whenever edges were merged or redirected.
#[derive(Debug, Default)]
pub struct NormalizeCfg {
    num_blocks_removed: AtomicU64,
    num_duplicate_edges_merged: AtomicU64,
}

impl NormalizeCfg {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        NormalizeCfg::default()
    }

    fn run_on_function(&self, function: &mut BinaryFunction, ctx: &BinaryContext) {
        let mut removed = 0u64;
        let mut duplicate_edges = 0u64;
        let mut needs_fix_branches = false;

        let ids: Vec<BlockId> = function.block_ids().collect();
        for id in ids {
            let bb = function.block(id);
            if !bb.is_empty() || bb.is_entry_point() || bb.is_landing_pad() {
                continue;
            }

            // Handle a dangling empty block.
            if bb.succ_size() == 0 {
                if bb.pred_size() == 0 {
                    function.block_mut(id).mark_valid(false);
                    removed += 1;
                }
                continue;
            }

            let Some(successor) = function.block(id).successor() else {
                debug_assert!(false, "empty block with multiple successors");
                continue;
            };

            // Redirect all predecessors to the successor block.
            while let Some(&predecessor) = function.block(id).predecessors().first() {
                if function.block(predecessor).has_jump_table() {
                    break;
                }
                if predecessor == successor {
                    break;
                }
                if !function.block(predecessor).is_successor(id) {
                    debug_assert!(false, "predecessor list out of sync");
                    break;
                }

                let info = function
                    .block(predecessor)
                    .branch_info_for(id)
                    .unwrap_or_default();
                function.replace_edge_target(predecessor, id, successor, info);
                // Branches still need fixing even if some predecessors could not be
                // redirected and the block survives.
                needs_fix_branches = true;
            }

            if function.block(id).pred_size() == 0 {
                function.remove_all_successors(id);
                function.block_mut(id).mark_valid(false);
                removed += 1;
            }
        }

        if removed > 0 {
            function.erase_invalid_blocks(None);
        }

        // Check for duplicate successors after empty-block elimination, which can create
        // more of them.
        for id in function.block_ids() {
            let bb = function.block(id);
            if !bb.has_jump_table()
                && bb.succ_size() == 2
                && bb.conditional_successor(false) == bb.conditional_successor(true)
            {
                duplicate_edges += 1;
            }
        }

        // Branch repair merges the duplicate edges and updates jump instructions.
        if duplicate_edges > 0 || needs_fix_branches {
            function.fix_branches(ctx.isa.as_ref());
        }

        self.num_blocks_removed.fetch_add(removed, Ordering::Relaxed);
        self.num_duplicate_edges_merged
            .fetch_add(duplicate_edges, Ordering::Relaxed);
    }
}

impl BinaryPass for NormalizeCfg {
    fn name(&self) -> &'static str {
        "normalize-cfg"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        run_on_each_function(
            ctx,
            SchedulingPolicy::BlockLinear,
            |function, ctx| self.run_on_function(function, ctx),
            |function| !self.should_optimize(function),
            self.name(),
        );

        let removed = self.num_blocks_removed.load(Ordering::Relaxed);
        if removed > 0 {
            ctx.sink.info(format_args!(
                "removed {removed} empty block{}",
                if removed == 1 { "" } else { "s" }
            ));
        }
        let merged = self.num_duplicate_edges_merged.load(Ordering::Relaxed);
        if merged > 0 {
            ctx.sink.info(format_args!(
                "merged {merged} duplicate CFG edge{}",
                if merged == 1 { "" } else { "s" }
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cfg::{CondCode, ExecCount},
        test::{test_context, FunctionBuilder},
    };

    #[test]
    fn test_empty_block_bypassed_with_weight_preserved() {
        // Entry -> B1 (empty, one successor B2) -> B2.
        let ctx = test_context();
        let id = FunctionBuilder::new("bypass", 0x1000)
            .block(|b| b.exec(100).jump(1).count(100))
            .block(|b| b.empty_with_successor(2))
            .block(|b| b.exec(100).ret())
            .build_into(&ctx);

        NormalizeCfg::new().run(&ctx).unwrap();

        ctx.with_function(id, |f| {
            let entry = BlockId::new(0);
            assert_eq!(f.block(entry).successors(), &[BlockId::new(2)]);
            assert_eq!(
                f.block(entry).branch_info()[0].count,
                ExecCount::new(100)
            );
            assert!(f.block(BlockId::new(1)).is_erased());
            assert!(f.validate_cfg());
        });
    }

    #[test]
    fn test_jump_table_predecessor_is_never_redirected() {
        let ctx = test_context();
        let id = FunctionBuilder::new("jt", 0x1000)
            .block(|b| b.jump_table(&[1, 2]))
            .block(|b| b.empty_with_successor(2))
            .block(|b| b.ret())
            .build_into(&ctx);

        NormalizeCfg::new().run(&ctx).unwrap();

        ctx.with_function(id, |f| {
            // The empty block survives because its only predecessor is an indirect branch.
            assert!(!f.block(BlockId::new(1)).is_erased());
            assert!(f
                .block(BlockId::new(0))
                .successors()
                .contains(&BlockId::new(1)));
        });
    }

    #[test]
    fn test_dangling_block_with_predecessor_is_kept() {
        let ctx = test_context();
        let id = FunctionBuilder::new("unreachable-intrinsic", 0x1000)
            .block(|b| b.cond(CondCode::Eq, 1, 2))
            .block(|b| b.empty_block()) // no successors, one predecessor
            .block(|b| b.ret())
            .build_into(&ctx);

        NormalizeCfg::new().run(&ctx).unwrap();

        ctx.with_function(id, |f| {
            assert!(!f.block(BlockId::new(1)).is_erased());
        });
    }

    #[test]
    fn test_duplicate_conditional_edges_are_merged() {
        let ctx = test_context();
        let id = FunctionBuilder::new("dup", 0x1000)
            .block(|b| b.cond(CondCode::Ne, 1, 1).counts(40, 60))
            .block(|b| b.ret())
            .build_into(&ctx);

        let pass = NormalizeCfg::new();
        pass.run(&ctx).unwrap();

        assert_eq!(pass.num_duplicate_edges_merged.load(Ordering::Relaxed), 1);
        ctx.with_function(id, |f| {
            let bb = f.block(BlockId::new(0));
            assert_eq!(bb.succ_size(), 1);
            assert_eq!(bb.branch_info()[0].count, ExecCount::new(100));
        });
    }

    #[test]
    fn test_no_dangling_blocks_remain() {
        let ctx = test_context();
        let id = FunctionBuilder::new("clean", 0x1000)
            .block(|b| b.jump(1))
            .block(|b| b.empty_block()) // dangling once entry edge is counted? no: has pred
            .block(|b| b.empty_block()) // fully dangling
            .build_into(&ctx);

        NormalizeCfg::new().run(&ctx).unwrap();

        ctx.with_function(id, |f| {
            for bid in f.block_ids() {
                let bb = f.block(bid);
                if bb.is_entry_point() || bb.is_landing_pad() || !bb.is_valid() {
                    continue;
                }
                assert!(
                    bb.pred_size() > 0 || bb.succ_size() > 0,
                    "dangling block survived normalization"
                );
            }
        });
    }
}
