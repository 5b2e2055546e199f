//! Conditional tail call simplification (SCTC).
//!
//! Converts the conditional-branch-then-unconditional-tail-call idiom into a single
//! conditional tail call:
//!
//! ```text
//! B0: jcc  B1          B0: jcc  foo   (conditional tail call)
//!     ...          ->      ...
//! B1: jmp  foo
//! ```
//!
//! The pass walks block pairs through three states: candidate (block holds a single direct
//! tail call and a predecessor branches into it), evaluated (direction and taken frequency
//! considered against the configured mode) and rewritten or skipped.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use dashmap::DashSet;

use crate::{
    binary::{BinaryContext, FunctionId, SymbolId},
    cfg::{AnnotationKind, BinaryFunction, BlockId, ExecCount},
    config::SctcMode,
    passes::{peephole::fix_double_jumps, BinaryPass},
    Result,
};

/// Rewrites conditional branches into conditional tail calls.
///
/// Only runs on architectures that expose the conditional tail call idiom; elsewhere the
/// pass is a no-op.
#[derive(Debug, Default)]
pub struct SimplifyConditionalTailCalls {
    num_candidate_tail_calls: AtomicU64,
    num_tail_calls_patched: AtomicU64,
    num_orig_forward_branches: AtomicU64,
    num_orig_backward_branches: AtomicU64,
    num_double_jumps: AtomicU64,
    deleted_blocks: AtomicU64,
    deleted_bytes: AtomicU64,
    ctc_taken_count: AtomicU64,
    ctc_exec_count: AtomicU64,
    /// Predecessors rewritten during this pass invocation; never rewritten twice.
    been_optimized: Mutex<HashSet<(FunctionId, BlockId)>>,
    modified: DashSet<FunctionId>,
}

impl SimplifyConditionalTailCalls {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        SimplifyConditionalTailCalls::default()
    }

    /// Tail calls patched across the run.
    #[must_use]
    pub fn patched(&self) -> u64 {
        self.num_tail_calls_patched.load(Ordering::Relaxed)
    }

    fn is_forward_call(ctx: &BinaryContext, function: &BinaryFunction, callee: SymbolId) -> bool {
        ctx.symbol_address(callee)
            .is_none_or(|address| address > function.address())
    }

    fn should_rewrite_branch(
        &self,
        ctx: &BinaryContext,
        function: &BinaryFunction,
        fid: FunctionId,
        pred: BlockId,
        bb: BlockId,
        direction_flag: bool,
    ) -> bool {
        if let Ok(been) = self.been_optimized.lock() {
            if been.contains(&(fid, pred)) {
                return false;
            }
        }

        let is_forward = function.is_forward_branch(pred, bb);
        if is_forward {
            self.num_orig_forward_branches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.num_orig_backward_branches.fetch_add(1, Ordering::Relaxed);
        }

        match ctx.opts.sctc_mode {
            SctcMode::Always => true,
            SctcMode::PreserveDirection => is_forward == direction_flag,
            SctcMode::Heuristic => {
                // Rewriting is fine when the new target ends up a backward branch, and when
                // no data is available the rewrite still shrinks code size.
                let Some((taken_freq, _mispred_freq)) = function.block(pred).branch_stats(bb)
                else {
                    return true;
                };

                // TODO: consider keying this on misprediction frequency instead of the
                // taken frequency.
                let result = (is_forward && taken_freq >= 0.5)
                    || (!is_forward && taken_freq <= 0.5);

                result == direction_flag
            }
        }
    }

    /// Rewrites all qualifying block pairs of one function.
    ///
    /// # Returns
    ///
    /// `true` if any conditional tail call was created.
    #[allow(clippy::too_many_lines)]
    fn fix_tail_calls(&self, function: &mut BinaryFunction, ctx: &BinaryContext) -> bool {
        // Branch direction detection needs up-to-date layout indices.
        function.layout_mut().update_indices();
        function.mark_unreachable_blocks();

        let fid = FunctionId(function.address());
        let isa = ctx.isa.as_ref();
        let mut local_candidates = 0u64;
        let mut local_ctcs = 0u64;
        let mut local_taken_count = 0u64;
        let mut local_exec_count = 0u64;
        let mut needs_uncond_branch: Vec<(BlockId, BlockId)> = Vec::new();

        let layout_order: Vec<BlockId> = function.layout().blocks().to_vec();
        for bb_id in layout_order {
            // Locate a block with a single direct tail-call instruction.
            if function.block(bb_id).num_non_pseudos() != 1 {
                continue;
            }
            let instr = function
                .block(bb_id)
                .first_non_pseudo()
                .expect("one non-pseudo instruction");
            if !isa.is_tail_call(instr) || isa.is_conditional_branch(instr) {
                continue;
            }
            let Some(callee) = isa.target_symbol(instr) else {
                continue;
            };
            let instr_offset = instr.annotations.get(AnnotationKind::Offset);

            // Direction of the possible conditional tail call.
            let is_forward_ctc = Self::is_forward_call(ctx, function, callee);

            let preds: Vec<BlockId> = function.block(bb_id).predecessors().to_vec();
            for pred in preds {
                let Some(cond_succ) = function.block(pred).conditional_successor(true) else {
                    continue;
                };

                local_candidates += 1;

                // Branch analysis can fail on unusual instructions; skip those sites. The
                // analysis also refuses dynamic conditions, which must not be rewritten.
                let Some(analysis) = function.analyze_branch(pred, isa) else {
                    continue;
                };
                let Some(cond_idx) = analysis.cond_branch else {
                    continue;
                };

                // The predecessor may also be a successor of the tail-call block, already
                // invalidated by an earlier iteration of this loop.
                if !function.block(pred).is_valid() {
                    continue;
                }

                // Don't reverse the direction of the branch without profile evidence.
                let direction_flag = if cond_succ == bb_id {
                    is_forward_ctc
                } else {
                    !is_forward_ctc
                };
                if !self.should_rewrite_branch(ctx, function, fid, pred, bb_id, direction_flag) {
                    continue;
                }

                if let Ok(mut been) = self.been_optimized.lock() {
                    been.insert((fid, pred));
                }

                let count = if cond_succ != bb_id {
                    // The taken edge goes elsewhere: reverse the condition and point the
                    // branch at the callee. The old taken target becomes the fall-through
                    // and may need an explicit unconditional branch later, since branch
                    // fixup does not run after this pass.
                    let reversed = isa.reverse_branch_condition(
                        &mut function.block_mut(pred).instructions_mut()[cond_idx],
                        callee,
                    );
                    debug_assert!(reversed, "dynamic branches are skipped above");
                    if !reversed {
                        continue;
                    }
                    needs_uncond_branch.push((pred, cond_succ));
                    function.block(pred).fallthrough_branch_info().count
                } else {
                    isa.replace_branch_target(
                        &mut function.block_mut(pred).instructions_mut()[cond_idx],
                        callee,
                    );
                    function.block(pred).taken_branch_info().count
                };
                let ctc_taken_freq = count.known_or_zero();

                {
                    let cond_branch = &mut function.block_mut(pred).instructions_mut()[cond_idx];
                    // Annotate so the branch classifies as a call from now on, and keep the
                    // taken frequency that dies with the removed edge.
                    isa.set_conditional_tail_call(cond_branch);
                    cond_branch
                        .annotations
                        .set(AnnotationKind::CtcTakenCount, ctc_taken_freq);
                    // The tail call kept the original input offset; carry it over.
                    if let Some(offset) = instr_offset {
                        cond_branch.annotations.set(AnnotationKind::Offset, offset);
                    }
                }

                // The successor edge is gone; later sweeps erase the block if nothing else
                // reaches it.
                function.remove_edge(pred, bb_id);

                let bb_exec = function.block(bb_id).known_execution_count();
                if ctc_taken_freq > 0 && ctc_taken_freq <= bb_exec {
                    let adjusted = function
                        .block(bb_id)
                        .execution_count()
                        .saturating_sub(ctc_taken_freq);
                    function.block_mut(bb_id).set_execution_count(adjusted);
                } else if ctc_taken_freq > bb_exec {
                    function.block_mut(bb_id).set_execution_count(ExecCount::ZERO);
                }

                local_ctcs += 1;
                local_taken_count += ctc_taken_freq;
                local_exec_count += function.block(pred).known_execution_count();
            }

            let bb = function.block(bb_id);
            let keep = bb.pred_size() != 0 || bb.is_landing_pad() || bb.is_entry_point();
            function.block_mut(bb_id).mark_valid(keep);
        }

        // Add unconditional branches to the new fall-through successors, unless the
        // successor already is a natural fall-through.
        for (pred, cond_succ) in needs_uncond_branch {
            let analysis = function.analyze_branch(pred, isa).unwrap_or_default();

            // Invalid blocks will be deleted, so they are not fall-through targets.
            let mut next = function.layout().block_after(pred);
            while let Some(candidate) = next {
                let bb = function.block(candidate);
                if bb.pred_size() != 0 || bb.is_landing_pad() || bb.is_entry_point() {
                    break;
                }
                next = function.layout().block_after(candidate);
            }

            let pred_succ = function.block(pred).successor();
            debug_assert!(pred_succ.is_some(), "the other branch should be a tail call");
            let has_fallthrough = next.is_some() && pred_succ == next;

            let cond_succ_label = function.block(cond_succ).label();
            if let Some(uncond_idx) = analysis.uncond_branch {
                if has_fallthrough {
                    function.block_mut(pred).erase_instruction(uncond_idx);
                } else {
                    isa.replace_branch_target(
                        &mut function.block_mut(pred).instructions_mut()[uncond_idx],
                        cond_succ_label,
                    );
                }
            } else if !has_fallthrough {
                let branch = isa.create_uncond_branch(cond_succ_label);
                function.block_mut(pred).add_instruction(branch);
            }
        }

        if local_ctcs > 0 {
            let double_jumps = fix_double_jumps(function, isa, true);
            self.num_double_jumps.fetch_add(double_jumps, Ordering::Relaxed);

            // Clean up unreachable tail-call blocks.
            let mut emitter = ctx.create_independent_emitter();
            let (blocks, bytes) = function.erase_invalid_blocks(Some(&mut emitter));
            self.deleted_blocks.fetch_add(blocks as u64, Ordering::Relaxed);
            self.deleted_bytes.fetch_add(bytes, Ordering::Relaxed);

            debug_assert!(function.validate_cfg());
        }

        self.num_tail_calls_patched.fetch_add(local_ctcs, Ordering::Relaxed);
        self.num_candidate_tail_calls
            .fetch_add(local_candidates, Ordering::Relaxed);
        self.ctc_taken_count.fetch_add(local_taken_count, Ordering::Relaxed);
        self.ctc_exec_count.fetch_add(local_exec_count, Ordering::Relaxed);

        local_ctcs > 0
    }
}

impl BinaryPass for SimplifyConditionalTailCalls {
    fn name(&self) -> &'static str {
        "simplify-conditional-tail-calls"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        if !ctx.isa.supports_conditional_tail_calls() {
            return Ok(());
        }

        for id in ctx.function_ids() {
            ctx.with_function_mut(id, |function| {
                if !self.should_optimize(function) {
                    return;
                }
                if self.fix_tail_calls(function, ctx) {
                    self.modified.insert(id);
                    function.set_has_canonical_cfg(false);
                }
            });
        }

        let patched = self.num_tail_calls_patched.load(Ordering::Relaxed);
        if patched > 0 {
            ctx.sink.info(format_args!(
                "SCTC: patched {patched} tail calls ({} forward) tail calls ({} backward) \
                 from a total of {} while removing {} double jumps and removing {} basic \
                 blocks totalling {} bytes of code. CTCs total execution count is {} and \
                 the number of times CTCs are taken is {}",
                self.num_orig_forward_branches.load(Ordering::Relaxed),
                self.num_orig_backward_branches.load(Ordering::Relaxed),
                self.num_candidate_tail_calls.load(Ordering::Relaxed),
                self.num_double_jumps.load(Ordering::Relaxed),
                self.deleted_blocks.load(Ordering::Relaxed),
                self.deleted_bytes.load(Ordering::Relaxed),
                self.ctc_exec_count.load(Ordering::Relaxed),
                self.ctc_taken_count.load(Ordering::Relaxed),
            ));
        }
        Ok(())
    }
}
