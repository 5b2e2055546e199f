//! Machine function representation: a block arena plus layout, flags and unwind state.
//!
//! # Architecture
//!
//! ```text
//! BinaryFunction
//! ├── blocks: Vec<BasicBlock>     // arena with stable BlockId handles
//! ├── layout: FunctionLayout      // emission order + fragments
//! ├── exception_ranges            // EH coverage, recomputed after CFG edits
//! └── flags                       // simple / ignored / finalized / CFG state
//! ```
//!
//! Blocks are never removed mid-iteration. Structural passes mark blocks invalid and sweep
//! them with [`erase_invalid_blocks`](BinaryFunction::erase_invalid_blocks) at well-defined
//! points; a swept block leaves a tombstone so existing [`BlockId`] handles stay stable.
//!
//! All edge surgery lives here rather than on [`BasicBlock`], because every edge mutation has
//! to update two blocks' adjacency lists consistently.

use crate::{
    binary::{SizeEstimator, SymbolId},
    cfg::{
        BasicBlock, BlockId, BranchInfo, ExecCount, FunctionLayout, Instruction, Operation,
        PseudoKind,
    },
    isa::InstructionSemantics,
};

/// Result of analyzing the branch structure at the end of a basic block.
///
/// Indices point into the block's instruction sequence. Analysis refuses unusual terminators
/// (indirect branches, non-reversible conditions) by returning `None` from
/// [`BinaryFunction::analyze_branch`]; callers are expected to skip such sites.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchAnalysis {
    /// Index of the terminating conditional branch, if present.
    pub cond_branch: Option<usize>,
    /// Index of the terminating unconditional branch, if present.
    pub uncond_branch: Option<usize>,
}

/// An exception-handling range: the covered blocks and their landing pad.
#[derive(Debug, Clone)]
pub struct ExceptionRange {
    /// Blocks covered by this handler, kept in layout order.
    pub covered: Vec<BlockId>,
    /// The landing-pad block receiving control on an unwound exception.
    pub landing_pad: BlockId,
}

/// A machine function under optimization.
///
/// Created from an already-disassembled CFG (construction is the loader's business), mutated
/// by the pass pipeline, and finalized before emission.
#[derive(Debug, Clone)]
pub struct BinaryFunction {
    /// Demangled function name.
    name: String,
    /// Address of the function in the input binary.
    address: u64,
    /// Maximum size the function may occupy when rewritten in place.
    max_size: u64,
    /// Estimated size of embedded constant islands.
    island_size: u64,
    /// Alignment requirement of constant islands.
    island_alignment: u64,
    /// Block arena; erased entries are tombstones.
    blocks: Vec<BasicBlock>,
    /// Emission order and fragments.
    layout: FunctionLayout,
    /// Exception-handling ranges.
    exception_ranges: Vec<ExceptionRange>,
    /// Whether the function can be safely rewritten.
    simple: bool,
    /// Whether the function was explicitly excluded from optimization.
    ignored: bool,
    /// Whether the function has a reconstructed CFG.
    has_cfg: bool,
    /// Whether the function's layout and CFI state are frozen.
    finalized: bool,
    /// Whether the CFG is in canonical form (no pending branch fixups).
    has_canonical_cfg: bool,
    /// Whether padding no-ops must be preserved.
    preserve_nops: bool,
    /// Profile-derived entry count.
    exec_count: ExecCount,
    /// Raw profile samples attributed to the function.
    raw_sample_count: u64,
    /// Whether the attached profile matches the current CFG.
    valid_profile: bool,
    /// Whether the profile was inferred from a stale one.
    inferred_profile: bool,
}

impl BinaryFunction {
    /// Creates an empty function shell.
    ///
    /// # Arguments
    ///
    /// * `name` - Demangled function name
    /// * `address` - Address in the input binary
    #[must_use]
    pub fn new(name: impl Into<String>, address: u64) -> Self {
        BinaryFunction {
            name: name.into(),
            address,
            max_size: u64::MAX,
            island_size: 0,
            island_alignment: 1,
            blocks: Vec::new(),
            layout: FunctionLayout::default(),
            exception_ranges: Vec::new(),
            simple: true,
            ignored: false,
            has_cfg: true,
            finalized: false,
            has_canonical_cfg: true,
            preserve_nops: false,
            exec_count: ExecCount::NO_PROFILE,
            raw_sample_count: 0,
            valid_profile: false,
            inferred_profile: false,
        }
    }

    // ── Attribute accessors ─────────────────────────────────────────────

    /// Returns the function name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the function's address in the input binary.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the maximum in-place size of the function.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Sets the maximum in-place size of the function.
    pub fn set_max_size(&mut self, size: u64) {
        self.max_size = size;
    }

    /// Returns `true` if the function has constant islands.
    #[must_use]
    pub fn has_islands(&self) -> bool {
        self.island_size > 0
    }

    /// Returns the estimated constant-island size.
    #[must_use]
    pub fn island_size(&self) -> u64 {
        self.island_size
    }

    /// Returns the constant-island alignment.
    #[must_use]
    pub fn island_alignment(&self) -> u64 {
        self.island_alignment
    }

    /// Sets constant-island size and alignment.
    pub fn set_islands(&mut self, size: u64, alignment: u64) {
        self.island_size = size;
        self.island_alignment = alignment.max(1);
    }

    /// Returns `true` if the function can be safely rewritten.
    #[must_use]
    pub fn is_simple(&self) -> bool {
        self.simple
    }

    /// Marks the function as rewritable or not.
    pub fn set_simple(&mut self, simple: bool) {
        self.simple = simple;
    }

    /// Returns `true` if the function was excluded from optimization.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    /// Excludes the function from optimization.
    pub fn set_ignored(&mut self, ignored: bool) {
        self.ignored = ignored;
    }

    /// Returns `true` if the function has a reconstructed CFG.
    #[must_use]
    pub fn has_cfg(&self) -> bool {
        self.has_cfg
    }

    /// Sets the CFG-state flag.
    pub fn set_has_cfg(&mut self, has_cfg: bool) {
        self.has_cfg = has_cfg;
    }

    /// Returns `true` once the function's layout and CFI state are frozen.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Freezes the function for emission.
    pub fn set_finalized(&mut self) {
        self.finalized = true;
    }

    /// Returns `true` if the CFG has no pending branch fixups.
    #[must_use]
    pub fn has_canonical_cfg(&self) -> bool {
        self.has_canonical_cfg
    }

    /// Sets the canonical-CFG flag.
    pub fn set_has_canonical_cfg(&mut self, canonical: bool) {
        self.has_canonical_cfg = canonical;
    }

    /// Returns `true` if padding no-ops must be preserved.
    #[must_use]
    pub fn should_preserve_nops(&self) -> bool {
        self.preserve_nops
    }

    /// Requests that padding no-ops be preserved.
    pub fn set_preserve_nops(&mut self, preserve: bool) {
        self.preserve_nops = preserve;
    }

    /// Returns the profile-derived entry count.
    #[must_use]
    pub fn execution_count(&self) -> ExecCount {
        self.exec_count
    }

    /// Returns the entry count, treating missing profile data as zero.
    #[must_use]
    pub fn known_execution_count(&self) -> u64 {
        self.exec_count.known_or_zero()
    }

    /// Sets the profile-derived entry count.
    pub fn set_execution_count(&mut self, count: ExecCount) {
        self.exec_count = count;
    }

    /// Returns the raw sample count attributed to this function.
    #[must_use]
    pub fn raw_sample_count(&self) -> u64 {
        self.raw_sample_count
    }

    /// Sets the raw sample count.
    pub fn set_raw_sample_count(&mut self, samples: u64) {
        self.raw_sample_count = samples;
    }

    /// Returns `true` if any profile data is attached.
    #[must_use]
    pub fn has_profile(&self) -> bool {
        self.exec_count.is_profiled() || self.raw_sample_count > 0
    }

    /// Returns `true` if the attached profile matches the current CFG.
    #[must_use]
    pub fn has_valid_profile(&self) -> bool {
        self.valid_profile
    }

    /// Sets the profile-validity flag.
    pub fn set_valid_profile(&mut self, valid: bool) {
        self.valid_profile = valid;
    }

    /// Returns `true` if the profile was inferred from a stale one.
    #[must_use]
    pub fn has_inferred_profile(&self) -> bool {
        self.inferred_profile
    }

    /// Marks the profile as inferred.
    pub fn set_inferred_profile(&mut self, inferred: bool) {
        self.inferred_profile = inferred;
    }

    // ── Block arena ─────────────────────────────────────────────────────

    /// Appends a new empty block to the arena and the end of the layout.
    ///
    /// # Arguments
    ///
    /// * `label` - Symbol labeling the new block
    ///
    /// # Returns
    ///
    /// The handle of the new block.
    pub fn add_basic_block(&mut self, label: SymbolId) -> BlockId {
        let id = BlockId::new(self.blocks.len());
        self.blocks.push(BasicBlock::new(label));
        self.layout.push(id);
        id
    }

    /// Returns the block behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    /// Returns the block behind `id` mutably.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    /// Returns the handle of the block labeled `label`, if any.
    #[must_use]
    pub fn block_with_label(&self, label: SymbolId) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|bb| !bb.erased && bb.label == label)
            .map(BlockId::new)
    }

    /// Iterates over the handles of all live (non-erased) blocks in arena order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, bb)| !bb.erased)
            .map(|(idx, _)| BlockId::new(idx))
    }

    /// Returns the number of live blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.iter().filter(|bb| !bb.erased).count()
    }

    /// Returns the emission layout.
    #[must_use]
    pub fn layout(&self) -> &FunctionLayout {
        &self.layout
    }

    /// Returns the emission layout mutably.
    pub fn layout_mut(&mut self) -> &mut FunctionLayout {
        &mut self.layout
    }

    /// Returns the exception-handling ranges.
    #[must_use]
    pub fn exception_ranges(&self) -> &[ExceptionRange] {
        &self.exception_ranges
    }

    /// Replaces the exception-handling ranges.
    pub fn set_exception_ranges(&mut self, ranges: Vec<ExceptionRange>) {
        self.exception_ranges = ranges;
    }

    /// Total number of non-pseudo instructions across live blocks.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.block_ids()
            .map(|id| self.block(id).num_non_pseudos())
            .sum()
    }

    /// Profile-weighted size score used for ranking functions in reports.
    #[must_use]
    pub fn function_score(&self) -> u64 {
        self.block_ids()
            .map(|id| {
                let bb = self.block(id);
                bb.known_execution_count() * bb.num_non_pseudos() as u64
            })
            .sum()
    }

    // ── Edge surgery ────────────────────────────────────────────────────

    /// Adds an edge `pred -> succ` carrying `info`.
    pub fn add_edge(&mut self, pred: BlockId, succ: BlockId, info: BranchInfo) {
        let pb = &mut self.blocks[pred.index()];
        pb.succs.push(succ);
        pb.branch_info.push(info);
        self.blocks[succ.index()].preds.push(pred);
    }

    /// Removes one edge `pred -> succ`, keeping the predecessor link if parallel edges remain.
    pub fn remove_edge(&mut self, pred: BlockId, succ: BlockId) {
        let pb = &mut self.blocks[pred.index()];
        if let Some(idx) = pb.succs.iter().position(|&s| s == succ) {
            pb.succs.remove(idx);
            pb.branch_info.remove(idx);
        }
        let still_linked = self.blocks[pred.index()].succs.contains(&succ);
        if !still_linked {
            let sb = &mut self.blocks[succ.index()];
            if let Some(idx) = sb.preds.iter().position(|&p| p == pred) {
                sb.preds.remove(idx);
            }
        }
    }

    /// Redirects the edge `pred -> old` to `pred -> new`, installing `info` on it.
    pub fn replace_edge_target(
        &mut self,
        pred: BlockId,
        old: BlockId,
        new: BlockId,
        info: BranchInfo,
    ) {
        let pb = &mut self.blocks[pred.index()];
        if let Some(idx) = pb.succs.iter().position(|&s| s == old) {
            pb.succs[idx] = new;
            pb.branch_info[idx] = info;
        }
        let still_linked = self.blocks[pred.index()].succs.contains(&old);
        if !still_linked {
            let ob = &mut self.blocks[old.index()];
            if let Some(idx) = ob.preds.iter().position(|&p| p == pred) {
                ob.preds.remove(idx);
            }
        }
        let nb = &mut self.blocks[new.index()];
        if !nb.preds.contains(&pred) {
            nb.preds.push(pred);
        }
    }

    /// Removes every outgoing edge of `block`.
    pub fn remove_all_successors(&mut self, block: BlockId) {
        let succs = std::mem::take(&mut self.blocks[block.index()].succs);
        self.blocks[block.index()].branch_info.clear();
        for succ in succs {
            let sb = &mut self.blocks[succ.index()];
            if let Some(idx) = sb.preds.iter().position(|&p| p == block) {
                sb.preds.remove(idx);
            }
        }
    }

    /// Collapses the duplicate conditional edges of `block` into a single edge.
    ///
    /// The taken and fall-through edges must point at the same target. Their weights are
    /// merged and the conditional branch instruction at `cond_idx` is deleted.
    pub fn remove_duplicate_conditional_successor(&mut self, block: BlockId, cond_idx: usize) {
        let bb = &mut self.blocks[block.index()];
        debug_assert_eq!(bb.succs.len(), 2);
        debug_assert_eq!(bb.succs[0], bb.succs[1]);

        let merged = BranchInfo {
            count: bb.branch_info[0].count.saturating_add(bb.branch_info[1].count),
            mispredicted: bb.branch_info[0]
                .mispredicted
                .saturating_add(bb.branch_info[1].mispredicted),
        };
        let target = bb.succs[0];
        bb.succs.truncate(1);
        bb.branch_info.truncate(1);
        bb.branch_info[0] = merged;
        bb.instructions.remove(cond_idx);

        // Deduplicate the predecessor link left behind by the parallel edge.
        let sb = &mut self.blocks[target.index()];
        let mut seen = false;
        sb.preds.retain(|&p| {
            if p == block {
                let keep = !seen;
                seen = true;
                keep
            } else {
                true
            }
        });
    }

    // ── Branch analysis and repair ──────────────────────────────────────

    /// Analyzes the terminating branch structure of `block`.
    ///
    /// Returns `None` for unanalyzable terminators: indirect branches, dynamic conditions,
    /// or malformed instruction sequences. Callers skip such sites rather than failing.
    #[must_use]
    pub fn analyze_branch(
        &self,
        block: BlockId,
        isa: &dyn InstructionSemantics,
    ) -> Option<BranchAnalysis> {
        let bb = self.block(block);
        let mut analysis = BranchAnalysis::default();

        for idx in (0..bb.instructions.len()).rev() {
            let inst = &bb.instructions[idx];
            if inst.is_pseudo() {
                continue;
            }
            if isa.is_indirect_branch(inst) {
                return None;
            }
            if isa.is_unconditional_branch(inst) && !isa.is_tail_call(inst) {
                if analysis.uncond_branch.is_some() || analysis.cond_branch.is_some() {
                    return None;
                }
                analysis.uncond_branch = Some(idx);
                continue;
            }
            if isa.is_conditional_branch(inst) && !isa.is_tail_call(inst) {
                if isa.is_dynamic_branch(inst) {
                    return None;
                }
                if analysis.cond_branch.is_some() {
                    return None;
                }
                analysis.cond_branch = Some(idx);
                continue;
            }
            // Anything else terminates the scan; tail calls classify as calls, not as
            // repairable branches.
            break;
        }
        Some(analysis)
    }

    /// Returns `true` if the branch `from -> to` goes forward in the current layout.
    #[must_use]
    pub fn is_forward_branch(&self, from: BlockId, to: BlockId) -> bool {
        match (self.layout.index_of(from), self.layout.index_of(to)) {
            (Some(f), Some(t)) => t > f,
            _ => true,
        }
    }

    /// Repairs the branch instructions of every live block to match its successor list and
    /// the current layout.
    ///
    /// Handles: duplicate conditional edges (merged, weights summed), stale unconditional
    /// branches to fall-through targets (removed), missing terminal branches (inserted) and
    /// retargeted branches after edge surgery. Blocks whose terminators cannot be analyzed
    /// are left untouched.
    pub fn fix_branches(&mut self, isa: &dyn InstructionSemantics) {
        let order: Vec<BlockId> = self.layout.blocks().to_vec();
        for &block in &order {
            if self.block(block).is_erased() || self.block(block).has_jump_table() {
                continue;
            }

            // Merge duplicate conditional edges first; this can downgrade the block to a
            // single-successor shape handled below.
            if self.block(block).succ_size() == 2
                && self.block(block).conditional_successor(true)
                    == self.block(block).conditional_successor(false)
            {
                if let Some(analysis) = self.analyze_branch(block, isa) {
                    if let Some(cond_idx) = analysis.cond_branch {
                        self.remove_duplicate_conditional_successor(block, cond_idx);
                    }
                }
            }

            let Some(analysis) = self.analyze_branch(block, isa) else {
                continue;
            };
            let fallthrough = self.layout.block_after(block);

            match self.block(block).succ_size() {
                0 => {}
                1 => {
                    let target = self.block(block).successors()[0];
                    let target_label = self.block(target).label();
                    // A lone successor never needs a conditional branch.
                    if let Some(cond_idx) = analysis.cond_branch {
                        self.block_mut(block).erase_instruction(cond_idx);
                    }
                    let analysis = self
                        .analyze_branch(block, isa)
                        .unwrap_or_default();
                    if fallthrough == Some(target) {
                        if let Some(idx) = analysis.uncond_branch {
                            self.block_mut(block).erase_instruction(idx);
                        }
                    } else {
                        match analysis.uncond_branch {
                            Some(idx) => {
                                isa.replace_branch_target(
                                    &mut self.block_mut(block).instructions_mut()[idx],
                                    target_label,
                                );
                            }
                            None => {
                                let branch = isa.create_uncond_branch(target_label);
                                self.block_mut(block).add_instruction(branch);
                            }
                        }
                    }
                }
                2 => {
                    let taken = self.block(block).successors()[0];
                    let not_taken = self.block(block).successors()[1];
                    let taken_label = self.block(taken).label();
                    let not_taken_label = self.block(not_taken).label();

                    if let Some(idx) = analysis.cond_branch {
                        isa.replace_branch_target(
                            &mut self.block_mut(block).instructions_mut()[idx],
                            taken_label,
                        );
                    }
                    if fallthrough == Some(not_taken) {
                        if let Some(idx) = analysis.uncond_branch {
                            self.block_mut(block).erase_instruction(idx);
                        }
                    } else {
                        match analysis.uncond_branch {
                            Some(idx) => {
                                isa.replace_branch_target(
                                    &mut self.block_mut(block).instructions_mut()[idx],
                                    not_taken_label,
                                );
                            }
                            None => {
                                let branch = isa.create_uncond_branch(not_taken_label);
                                self.block_mut(block).add_instruction(branch);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        self.has_canonical_cfg = true;
    }

    // ── Reachability and deferred removal ───────────────────────────────

    /// Marks every block unreachable from an entry point or landing pad as invalid.
    ///
    /// Reached blocks are marked valid; the subsequent sweep erases the rest.
    pub fn mark_unreachable_blocks(&mut self) {
        let mut stack: Vec<BlockId> = Vec::new();
        for id in self.block_ids().collect::<Vec<_>>() {
            let bb = self.block_mut(id);
            let is_root = bb.is_entry || bb.is_landing_pad;
            bb.valid = is_root;
            if is_root {
                stack.push(id);
            }
        }

        while let Some(id) = stack.pop() {
            let succs: Vec<BlockId> = self.block(id).successors().to_vec();
            for succ in succs {
                let sb = self.block_mut(succ);
                if !sb.erased && !sb.valid {
                    sb.valid = true;
                    stack.push(succ);
                }
            }
        }
    }

    /// Sweeps all invalid blocks out of the arena.
    ///
    /// Each swept block is detached from the CFG, removed from the layout and turned into a
    /// tombstone. When an `estimator` is supplied, the code size of the removed instructions
    /// is measured on it; the estimator must be an independent throwaway instance.
    ///
    /// # Returns
    ///
    /// The number of blocks removed and the bytes of code they represented.
    pub fn erase_invalid_blocks(
        &mut self,
        mut estimator: Option<&mut SizeEstimator>,
    ) -> (usize, u64) {
        let mut count = 0usize;
        let mut bytes = 0u64;

        let doomed: Vec<BlockId> = self
            .block_ids()
            .filter(|&id| !self.block(id).valid)
            .collect();

        for id in doomed {
            if let Some(est) = estimator.as_deref_mut() {
                bytes += est.estimate_block(self.block(id));
            }
            self.remove_all_successors(id);

            let preds: Vec<BlockId> = self.block(id).predecessors().to_vec();
            for pred in preds {
                // Parallel edges collapse together with their predecessor link.
                while self.block(pred).successors().contains(&id) {
                    self.remove_edge(pred, id);
                }
            }

            self.layout.erase(id);
            let bb = self.block_mut(id);
            bb.instructions.clear();
            bb.erased = true;
            count += 1;
        }

        if count > 0 {
            self.update_exception_ranges();
        }
        (count, bytes)
    }

    /// Splits `block` at instruction `idx`, moving the tail into a new block.
    ///
    /// The new block inherits the successors, jump-table flag, CFI state and execution count
    /// of the original; the original keeps the head instructions and falls through to the new
    /// block. The new block is placed immediately after the original in the layout.
    ///
    /// # Arguments
    ///
    /// * `block` - Block to split
    /// * `idx` - Index of the first instruction that moves to the new block
    /// * `label` - Symbol labeling the new block
    ///
    /// # Returns
    ///
    /// The handle of the new block.
    pub fn split_block_at(&mut self, block: BlockId, idx: usize, label: SymbolId) -> BlockId {
        let new_id = BlockId::new(self.blocks.len());

        let bb = &mut self.blocks[block.index()];
        let tail = bb.instructions.split_off(idx);
        let succs = std::mem::take(&mut bb.succs);
        let infos = std::mem::take(&mut bb.branch_info);
        let exec = bb.exec_count;
        let cfi = bb.cfi_state;
        let jt = bb.has_jump_table;
        bb.has_jump_table = false;

        let mut new_block = BasicBlock::new(label);
        new_block.instructions = tail;
        new_block.exec_count = exec;
        new_block.cfi_state = cfi;
        new_block.has_jump_table = jt;
        new_block.succs = succs.clone();
        new_block.branch_info = infos;
        self.blocks.push(new_block);

        for succ in succs {
            let sb = &mut self.blocks[succ.index()];
            for pred in sb.preds.iter_mut() {
                if *pred == block {
                    *pred = new_id;
                }
            }
        }

        self.add_edge(block, new_id, BranchInfo { count: exec, mispredicted: ExecCount::ZERO });
        self.layout.insert_after(block, new_id);
        new_id
    }

    // ── Exception ranges and CFI state ──────────────────────────────────

    /// Recomputes exception-handling ranges after CFG changes.
    ///
    /// Erased blocks are dropped from coverage; ranges whose landing pad or entire coverage
    /// disappeared are deleted; surviving coverage is reordered to match the layout.
    pub fn update_exception_ranges(&mut self) {
        let blocks = &self.blocks;
        let layout = &self.layout;
        self.exception_ranges.retain_mut(|range| {
            if blocks[range.landing_pad.index()].erased {
                return false;
            }
            range.covered.retain(|&id| !blocks[id.index()].erased);
            range
                .covered
                .sort_by_key(|&id| layout.index_of(id).unwrap_or(usize::MAX));
            !range.covered.is_empty()
        });
    }

    /// Reconciles per-block CFI states along the layout.
    ///
    /// Walks the emission order maintaining a stack of remembered unwind states. A state
    /// increase pushes the current state and emits a remember directive; a decrease must
    /// restore a state still on the stack, emitting restore directives. A block that needs a
    /// state that was never remembered cannot be reconciled.
    ///
    /// # Returns
    ///
    /// `true` if every transition could be reconciled.
    pub fn finalize_cfi_state(&mut self) -> bool {
        let order: Vec<BlockId> = self.layout.blocks().to_vec();
        let mut stack: Vec<i32> = Vec::new();
        let mut current = 0i32;

        for block in order {
            let state = self.block(block).cfi_state;
            if state < 0 {
                return false;
            }
            if state == current {
                continue;
            }
            if state > current {
                stack.push(current);
                let inst = Instruction::new(Operation::Pseudo(PseudoKind::CfiRememberState));
                self.block_mut(block).instructions.insert(0, inst);
                current = state;
            } else {
                loop {
                    match stack.pop() {
                        Some(prev) if prev == state => {
                            let inst =
                                Instruction::new(Operation::Pseudo(PseudoKind::CfiRestoreState));
                            self.block_mut(block).instructions.insert(0, inst);
                            current = state;
                            break;
                        }
                        Some(_) => continue,
                        None => return false,
                    }
                }
            }
        }
        true
    }

    // ── Validation ──────────────────────────────────────────────────────

    /// Checks CFG adjacency invariants.
    ///
    /// Every successor edge must have a matching predecessor entry and vice versa; edge lists
    /// must not reference erased blocks; branch-info lists must stay parallel to successor
    /// lists.
    #[must_use]
    pub fn validate_cfg(&self) -> bool {
        for id in self.block_ids() {
            let bb = self.block(id);
            if bb.succs.len() != bb.branch_info.len() {
                return false;
            }
            for &succ in &bb.succs {
                let sb = &self.blocks[succ.index()];
                if sb.erased || !sb.preds.contains(&id) {
                    return false;
                }
            }
            for &pred in &bb.preds {
                let pb = &self.blocks[pred.index()];
                if pb.erased || !pb.succs.contains(&id) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{isa::X64, test::FunctionBuilder};

    #[test]
    fn test_edge_surgery_keeps_adjacency_consistent() {
        let isa = X64::new();
        let mut f = FunctionBuilder::new("edges", 0x1000)
            .block(|b| b.cond(crate::cfg::CondCode::Eq, 1, 2).counts(60, 40))
            .block(|b| b.jump(3))
            .block(|b| b.jump(3))
            .block(|b| b.ret())
            .build();

        assert!(f.validate_cfg());

        // Redirect 1 -> 3 to 1 -> 2 and check both sides.
        f.replace_edge_target(
            BlockId::new(1),
            BlockId::new(3),
            BlockId::new(2),
            BranchInfo::new(60, 0),
        );
        assert!(f.block(BlockId::new(2)).predecessors().contains(&BlockId::new(1)));
        assert!(!f.block(BlockId::new(3)).predecessors().contains(&BlockId::new(1)));
        f.fix_branches(&isa);
        assert!(f.validate_cfg());
    }

    #[test]
    fn test_mark_unreachable_and_erase() {
        let mut f = FunctionBuilder::new("dead", 0x1000)
            .block(|b| b.jump(1))
            .block(|b| b.ret())
            .block(|b| b.ret()) // unreachable
            .build();

        f.mark_unreachable_blocks();
        assert!(!f.block(BlockId::new(2)).is_valid());

        let (count, _) = f.erase_invalid_blocks(None);
        assert_eq!(count, 1);
        assert!(f.block(BlockId::new(2)).is_erased());
        assert_eq!(f.block_count(), 2);
        assert_eq!(f.layout().block_count(), 2);
        assert!(f.validate_cfg());
    }

    #[test]
    fn test_fix_branches_removes_branch_to_fallthrough() {
        let isa = X64::new();
        let mut f = FunctionBuilder::new("ft", 0x1000)
            .block(|b| b.jump(1))
            .block(|b| b.ret())
            .build();

        // Block 0 jumps to block 1, which is also its layout fall-through.
        f.fix_branches(&isa);
        assert_eq!(f.block(BlockId::new(0)).num_non_pseudos(), 0);
    }

    #[test]
    fn test_fix_branches_merges_duplicate_conditional_edges() {
        let isa = X64::new();
        let mut f = FunctionBuilder::new("dup", 0x1000)
            .block(|b| b.cond(crate::cfg::CondCode::Eq, 1, 1).counts(30, 70))
            .block(|b| b.ret())
            .build();

        f.fix_branches(&isa);
        let bb = f.block(BlockId::new(0));
        assert_eq!(bb.succ_size(), 1);
        assert_eq!(bb.branch_info()[0].count.known(), Some(100));
        assert!(f.validate_cfg());
    }

    #[test]
    fn test_split_block_at() {
        let ctx_syms = crate::binary::SymbolTable::new();
        let label = ctx_syms.intern("split.tail", None);

        let mut f = FunctionBuilder::new("split", 0x1000)
            .block(|b| b.exec(50).push_nop().push_nop().jump(1))
            .block(|b| b.ret())
            .build();

        let new_id = f.split_block_at(BlockId::new(0), 1, label);
        assert_eq!(f.block(BlockId::new(0)).instructions().len(), 1);
        assert_eq!(f.block(new_id).successors(), &[BlockId::new(1)]);
        assert_eq!(f.block(BlockId::new(0)).successors(), &[new_id]);
        assert_eq!(f.block(new_id).known_execution_count(), 50);
        assert_eq!(
            f.layout().blocks(),
            &[BlockId::new(0), new_id, BlockId::new(1)]
        );
        assert!(f.validate_cfg());
    }

    #[test]
    fn test_finalize_cfi_state_restores_remembered_states() {
        let mut f = FunctionBuilder::new("cfi", 0x1000)
            .block(|b| b.jump(1))
            .block(|b| b.cfi_state(1).jump(2))
            .block(|b| b.cfi_state(0).ret())
            .build();

        assert!(f.finalize_cfi_state());
    }

    #[test]
    fn test_finalize_cfi_state_fails_on_unremembered_state() {
        let mut f = FunctionBuilder::new("cfi-bad", 0x1000)
            .block(|b| b.cfi_state(2).jump(1))
            .block(|b| b.cfi_state(1).ret())
            .build();

        // State 1 was never on the remember stack (0 -> 2 pushed only state 0).
        assert!(!f.finalize_cfi_state());
    }
}
