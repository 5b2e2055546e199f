//! Peephole optimizations: double jumps, tail-call traps, useless conditional branches.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    binary::BinaryContext,
    cfg::{AnnotationKind, BinaryFunction, BlockId},
    config::PeepholeFlags,
    isa::InstructionSemantics,
    passes::BinaryPass,
    Result,
};

/// Retargets jump instructions that jump to another basic block holding a single jump
/// instruction:
///
/// ```text
/// B0: ...
///     jmp  B1   (or jcc B1)
///
/// B1: jmp  B2
///
/// ->
///
/// B0: ...
///     jmp  B2   (or jcc B2)
/// ```
///
/// Predecessors reached through a jump table are never patched; the taken weight of the
/// patched edge moves to the final destination. In the tail-call case (the intermediate
/// block holds a tail call and therefore has no successor) the predecessor's unconditional
/// branch is replaced by a direct tail call.
///
/// # Arguments
///
/// * `function` - Function to rewrite
/// * `isa` - Instruction semantics oracle
/// * `mark_invalid` - Re-evaluate the intermediate block's validity after each patch, so a
///   later sweep can erase it once it loses all predecessors
///
/// # Returns
///
/// The number of double jumps removed.
pub(crate) fn fix_double_jumps(
    function: &mut BinaryFunction,
    isa: &dyn InstructionSemantics,
    mark_invalid: bool,
) -> u64 {
    let mut num_double_jumps = 0u64;

    let ids: Vec<BlockId> = function.block_ids().collect();
    for bb_id in ids {
        let bb = function.block(bb_id);
        if bb.num_non_pseudos() != 1 || bb.is_landing_pad() {
            continue;
        }

        let inst = bb.first_non_pseudo().expect("one non-pseudo instruction");
        let is_tail_call = isa.is_tail_call(inst);
        if !isa.is_unconditional_branch(inst) && !is_tail_call {
            continue;
        }
        // When running after the tail-call simplifier, leave conditional tail calls alone.
        if is_tail_call && isa.is_conditional_branch(inst) {
            continue;
        }

        let succ_sym = isa.target_symbol(inst);
        let offset = inst.annotations.get(AnnotationKind::Offset);
        let succ = bb.successor();

        if ((succ.is_none() || succ == Some(bb_id)) && !is_tail_call)
            || (is_tail_call && succ_sym.is_none())
        {
            continue;
        }

        let preds: Vec<BlockId> = bb.predecessors().to_vec();
        for pred in preds {
            if function.block(pred).is_landing_pad() {
                continue;
            }

            let pred_bb = function.block(pred);
            let targets_bb = pred_bb.successor() == Some(bb_id)
                || (pred_bb.conditional_successor(true) == Some(bb_id) && !is_tail_call)
                || pred_bb.conditional_successor(false) == Some(bb_id);
            if !targets_bb {
                continue;
            }

            if check_and_patch(function, isa, pred, bb_id, succ, succ_sym, offset) {
                num_double_jumps += 1;
                if mark_invalid {
                    let bb = function.block(bb_id);
                    let keep =
                        bb.pred_size() != 0 || bb.is_landing_pad() || bb.is_entry_point();
                    function.block_mut(bb_id).mark_valid(keep);
                }
            }
        }
    }

    num_double_jumps
}

/// Patches one predecessor of a single-jump block, redirecting it past the block.
fn check_and_patch(
    function: &mut BinaryFunction,
    isa: &dyn InstructionSemantics,
    pred: BlockId,
    bb: BlockId,
    succ: Option<BlockId>,
    succ_sym: Option<crate::binary::SymbolId>,
    offset: Option<u64>,
) -> bool {
    // Ignore infinite-loop jumps and fall-through tail jumps.
    if Some(pred) == succ || succ == Some(bb) {
        return false;
    }

    let bb_label = function.block(bb).label();

    if let Some(succ) = succ {
        let Some(analysis) = function.analyze_branch(pred, isa) else {
            return false;
        };

        let info = function.block(pred).branch_info_for(bb).unwrap_or_default();
        function.replace_edge_target(pred, bb, succ, info);

        // Patch up the existing branch instruction to match the new successor.
        let succ_label = function.block(succ).label();
        let cond_targets_bb = analysis.cond_branch.is_some_and(|idx| {
            isa.target_symbol(&function.block(pred).instructions()[idx]) == Some(bb_label)
        });
        let uncond_targets_bb = analysis.uncond_branch.is_some_and(|idx| {
            isa.target_symbol(&function.block(pred).instructions()[idx]) == Some(bb_label)
        });

        if cond_targets_bb {
            let idx = analysis.cond_branch.expect("checked above");
            isa.replace_branch_target(
                &mut function.block_mut(pred).instructions_mut()[idx],
                succ_label,
            );
        } else if uncond_targets_bb {
            let idx = analysis.uncond_branch.expect("checked above");
            isa.replace_branch_target(
                &mut function.block_mut(pred).instructions_mut()[idx],
                succ_label,
            );
        } else if analysis.uncond_branch.is_none() {
            // Don't add an explicit jump to a fall-through block.
            if function.layout().block_after(pred) != Some(succ) {
                let branch = isa.create_uncond_branch(succ_label);
                function.block_mut(pred).add_instruction(branch);
            }
        }
    } else {
        // The successor is absent in the tail-call case; replace the predecessor's
        // unconditional branch with a direct tail call.
        let Some(last_idx) = function.block(pred).last_non_pseudo_index() else {
            return false;
        };
        let last = &function.block(pred).instructions()[last_idx];
        if !isa.is_unconditional_branch(last) || isa.is_tail_call(last) {
            return false;
        }
        debug_assert_eq!(isa.target_symbol(last), Some(bb_label));

        let callee = succ_sym.expect("tail-call target checked by caller");
        function.remove_edge(pred, bb);
        function.block_mut(pred).erase_instruction(last_idx);
        let mut tail_call = isa.create_tail_call(callee);
        if let Some(offset) = offset {
            tail_call.annotations.set(AnnotationKind::Offset, offset);
        }
        function.block_mut(pred).add_instruction(tail_call);
    }

    true
}

/// Bitmask-gated peephole optimizations.
#[derive(Debug, Default)]
pub struct Peepholes {
    num_double_jumps: AtomicU64,
    tail_call_traps: AtomicU64,
    num_useless_cond_branches: AtomicU64,
}

impl Peepholes {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        Peepholes::default()
    }

    /// Double jumps removed across the run.
    #[must_use]
    pub fn double_jumps(&self) -> u64 {
        self.num_double_jumps.load(Ordering::Relaxed)
    }

    /// Appends a trap after indirect tail calls, so a corrupted jump target faults
    /// immediately instead of sliding into whatever follows.
    fn add_tailcall_traps(&self, function: &mut BinaryFunction, isa: &dyn InstructionSemantics) {
        let ids: Vec<BlockId> = function.block_ids().collect();
        for id in ids {
            let bb = function.block(id);
            let Some(last) = bb.last_non_pseudo() else {
                continue;
            };
            if isa.is_tail_call(last) && isa.is_indirect_branch(last) {
                let trap = isa.create_trap();
                function.block_mut(id).add_instruction(trap);
                self.tail_call_traps.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Collapses conditional branches whose both arms land on the same block.
    fn remove_useless_cond_branches(
        &self,
        function: &mut BinaryFunction,
        isa: &dyn InstructionSemantics,
    ) {
        let ids: Vec<BlockId> = function.block_ids().collect();
        for id in ids {
            let bb = function.block(id);
            if bb.succ_size() != 2 || bb.has_jump_table() {
                continue;
            }
            if bb.conditional_successor(true) != bb.conditional_successor(false) {
                continue;
            }

            // Branch analysis can fail on unusual terminators; skip those sites.
            let Some(analysis) = function.analyze_branch(id, isa) else {
                continue;
            };
            let Some(cond_idx) = analysis.cond_branch else {
                continue;
            };

            function.remove_duplicate_conditional_successor(id, cond_idx);
            self.num_useless_cond_branches.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl BinaryPass for Peepholes {
    fn name(&self) -> &'static str {
        "peepholes"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        let opts = ctx.opts.peepholes;
        if opts.is_empty() {
            return Ok(());
        }

        for id in ctx.function_ids() {
            ctx.with_function_mut(id, |function| {
                if !self.should_optimize(function) {
                    return;
                }
                if opts.contains(PeepholeFlags::DOUBLE_JUMPS) {
                    let fixed = fix_double_jumps(function, ctx.isa.as_ref(), false);
                    self.num_double_jumps.fetch_add(fixed, Ordering::Relaxed);
                }
                if opts.contains(PeepholeFlags::TAILCALL_TRAPS) {
                    self.add_tailcall_traps(function, ctx.isa.as_ref());
                }
                if opts.contains(PeepholeFlags::USELESS_BRANCHES) {
                    self.remove_useless_cond_branches(function, ctx.isa.as_ref());
                }
                debug_assert!(function.validate_cfg());
            });
        }

        ctx.sink.info(format_args!(
            "Peephole: {} double jumps patched.",
            self.num_double_jumps.load(Ordering::Relaxed)
        ));
        ctx.sink.info(format_args!(
            "Peephole: {} tail call traps inserted.",
            self.tail_call_traps.load(Ordering::Relaxed)
        ));
        ctx.sink.info(format_args!(
            "Peephole: {} useless conditional branches removed.",
            self.num_useless_cond_branches.load(Ordering::Relaxed)
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cfg::{CondCode, ExecCount},
        config::OptConfig,
        test::{test_context_with, FunctionBuilder},
    };

    fn peephole_ctx(flags: PeepholeFlags) -> crate::binary::BinaryContext {
        test_context_with(OptConfig {
            peepholes: flags,
            ..OptConfig::default()
        })
    }

    #[test]
    fn test_double_jump_weight_conservation() {
        // Two predecessors (taken counts 100 and 50) jump to a single-jump block.
        let ctx = peephole_ctx(PeepholeFlags::DOUBLE_JUMPS);
        let id = FunctionBuilder::new("double", 0x1000)
            .block(|b| b.exec(100).jump(2).count(100))
            .block(|b| b.exec(50).jump(2).count(50))
            .block(|b| b.exec(150).jump(3).count(150))
            .block(|b| b.exec(150).ret())
            .build_into(&ctx);

        let pass = Peepholes::new();
        pass.run(&ctx).unwrap();

        assert!(pass.double_jumps() >= 2);
        ctx.with_function(id, |f| {
            let target = BlockId::new(3);
            for pred in [BlockId::new(0), BlockId::new(1)] {
                assert_eq!(f.block(pred).successors(), &[target]);
            }
            // Weight conservation: redirected weights equal the original edge weights.
            assert_eq!(
                f.block(BlockId::new(0)).branch_info()[0].count,
                ExecCount::new(100)
            );
            assert_eq!(
                f.block(BlockId::new(1)).branch_info()[0].count,
                ExecCount::new(50)
            );
            assert!(f.validate_cfg());
        });
    }

    #[test]
    fn test_double_jump_idempotence() {
        let ctx = peephole_ctx(PeepholeFlags::DOUBLE_JUMPS);
        let id = FunctionBuilder::new("idem", 0x1000)
            .block(|b| b.jump(1).count(10))
            .block(|b| b.jump(2).count(10))
            .block(|b| b.ret())
            .build_into(&ctx);

        ctx.with_function_mut(id, |f| {
            let first = fix_double_jumps(f, ctx.isa.as_ref(), false);
            assert_eq!(first, 1);
            // A second run over the already-clean CFG changes nothing.
            let second = fix_double_jumps(f, ctx.isa.as_ref(), false);
            assert_eq!(second, 0);
        });
    }

    #[test]
    fn test_double_jump_into_tail_call() {
        let ctx = peephole_ctx(PeepholeFlags::DOUBLE_JUMPS);
        let id = FunctionBuilder::new("tail", 0x1000)
            .block(|b| b.jump(1))
            .block(|b| b.tail_call("callee"))
            .block(|b| b.entry().ret())
            .build_into(&ctx);

        let pass = Peepholes::new();
        pass.run(&ctx).unwrap();

        assert_eq!(pass.double_jumps(), 1);
        let callee = ctx.symbols.lookup("callee").unwrap();
        ctx.with_function(id, |f| {
            let pred = f.block(BlockId::new(0));
            let last = pred.last_non_pseudo().unwrap();
            assert!(ctx.isa.is_tail_call(last));
            assert_eq!(last.target, Some(callee));
            assert_eq!(pred.succ_size(), 0);
        });
    }

    #[test]
    fn test_tailcall_traps_inserted_after_indirect_tail_calls() {
        let ctx = peephole_ctx(PeepholeFlags::TAILCALL_TRAPS);
        let id = FunctionBuilder::new("traps", 0x1000)
            .block(|b| b.indirect_tail_call())
            .build_into(&ctx);

        let pass = Peepholes::new();
        pass.run(&ctx).unwrap();

        assert_eq!(pass.tail_call_traps.load(Ordering::Relaxed), 1);
        ctx.with_function(id, |f| {
            let bb = f.block(BlockId::new(0));
            let last = bb.last_non_pseudo().unwrap();
            assert!(ctx.isa.is_trap(last));
        });
    }

    #[test]
    fn test_useless_cond_branch_removed() {
        let ctx = peephole_ctx(PeepholeFlags::USELESS_BRANCHES);
        let id = FunctionBuilder::new("useless", 0x1000)
            .block(|b| b.cond(CondCode::Eq, 1, 1).counts(25, 75))
            .block(|b| b.ret())
            .build_into(&ctx);

        let pass = Peepholes::new();
        pass.run(&ctx).unwrap();

        assert_eq!(pass.num_useless_cond_branches.load(Ordering::Relaxed), 1);
        ctx.with_function(id, |f| {
            let bb = f.block(BlockId::new(0));
            assert_eq!(bb.succ_size(), 1);
            assert_eq!(bb.branch_info()[0].count, ExecCount::new(100));
        });
    }

    #[test]
    fn test_disabled_flags_do_nothing() {
        let ctx = peephole_ctx(PeepholeFlags::empty());
        let id = FunctionBuilder::new("off", 0x1000)
            .block(|b| b.jump(1).count(10))
            .block(|b| b.jump(2).count(10))
            .block(|b| b.ret())
            .build_into(&ctx);

        let pass = Peepholes::new();
        pass.run(&ctx).unwrap();
        assert_eq!(pass.double_jumps(), 0);
        ctx.with_function(id, |f| {
            assert_eq!(f.block(BlockId::new(0)).successors(), &[BlockId::new(1)]);
        });
    }
}
