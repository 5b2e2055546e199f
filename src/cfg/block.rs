//! Basic block representation.
//!
//! A basic block is owned exclusively by its function and identified by a stable [`BlockId`]
//! handle into the function's block arena. Handles stay valid across structural edits; erased
//! blocks leave a tombstone behind rather than shifting indices.

use crate::{
    binary::SymbolId,
    cfg::{BranchInfo, ExecCount, Instruction},
};

/// Stable handle to a basic block within its owning function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    /// Creates a handle from a raw arena index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        BlockId(index as u32)
    }

    /// Returns the raw arena index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A maximal straight-line instruction sequence with a single entry and exit.
///
/// Predecessor and successor lists are maintained by the owning
/// [`BinaryFunction`](crate::cfg::BinaryFunction); the per-edge [`BranchInfo`] list is kept
/// parallel to the successor list at all times.
///
/// # Validity
///
/// Blocks scheduled for removal are first marked invalid (`valid == false`) and only swept at
/// well-defined points, never mid-iteration. A swept block becomes an erased tombstone that
/// keeps its [`BlockId`] reserved.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Symbolic label of this block.
    pub(crate) label: SymbolId,
    /// Ordered instruction sequence.
    pub(crate) instructions: Vec<Instruction>,
    /// Predecessor blocks.
    pub(crate) preds: Vec<BlockId>,
    /// Successor blocks; parallel to `branch_info`.
    pub(crate) succs: Vec<BlockId>,
    /// Per-successor-edge profile data; parallel to `succs`.
    pub(crate) branch_info: Vec<BranchInfo>,
    /// Execution count of the block.
    pub(crate) exec_count: ExecCount,
    /// Whether the block is a function entry point.
    pub(crate) is_entry: bool,
    /// Whether the block is an exception landing pad.
    pub(crate) is_landing_pad: bool,
    /// Validity flag for deferred removal.
    pub(crate) valid: bool,
    /// Tombstone flag set by the sweep.
    pub(crate) erased: bool,
    /// Whether the terminating branch dispatches through a jump table.
    pub(crate) has_jump_table: bool,
    /// Call-frame-information state id at block entry (-1 when unknown).
    pub(crate) cfi_state: i32,
    /// Offset of the block in the input binary.
    pub(crate) input_offset: u64,
}

impl BasicBlock {
    /// Creates an empty, valid block with the given label.
    #[must_use]
    pub fn new(label: SymbolId) -> Self {
        BasicBlock {
            label,
            instructions: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            branch_info: Vec::new(),
            exec_count: ExecCount::NO_PROFILE,
            is_entry: false,
            is_landing_pad: false,
            valid: true,
            erased: false,
            has_jump_table: false,
            cfi_state: 0,
            input_offset: 0,
        }
    }

    /// Returns the block's label symbol.
    #[must_use]
    pub fn label(&self) -> SymbolId {
        self.label
    }

    /// Returns the instruction sequence.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Returns the instruction sequence mutably.
    pub fn instructions_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.instructions
    }

    /// Returns `true` if the block contains no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Returns the number of non-pseudo instructions.
    #[must_use]
    pub fn num_non_pseudos(&self) -> usize {
        self.instructions.iter().filter(|i| !i.is_pseudo()).count()
    }

    /// Returns the first non-pseudo instruction, if any.
    #[must_use]
    pub fn first_non_pseudo(&self) -> Option<&Instruction> {
        self.instructions.iter().find(|i| !i.is_pseudo())
    }

    /// Returns the index of the last non-pseudo instruction, if any.
    #[must_use]
    pub fn last_non_pseudo_index(&self) -> Option<usize> {
        self.instructions.iter().rposition(|i| !i.is_pseudo())
    }

    /// Returns the last non-pseudo instruction, if any.
    #[must_use]
    pub fn last_non_pseudo(&self) -> Option<&Instruction> {
        self.last_non_pseudo_index().map(|idx| &self.instructions[idx])
    }

    /// Returns the predecessor list.
    #[must_use]
    pub fn predecessors(&self) -> &[BlockId] {
        &self.preds
    }

    /// Returns the successor list.
    #[must_use]
    pub fn successors(&self) -> &[BlockId] {
        &self.succs
    }

    /// Returns the per-edge branch info, parallel to [`successors`](Self::successors).
    #[must_use]
    pub fn branch_info(&self) -> &[BranchInfo] {
        &self.branch_info
    }

    /// Number of predecessor edges.
    #[must_use]
    pub fn pred_size(&self) -> usize {
        self.preds.len()
    }

    /// Number of successor edges.
    #[must_use]
    pub fn succ_size(&self) -> usize {
        self.succs.len()
    }

    /// Returns the sole successor of a single-successor block.
    ///
    /// Mirrors the convention that a block with exactly one outgoing edge has an unambiguous
    /// fall-through/jump destination. Returns `None` for any other successor count.
    #[must_use]
    pub fn successor(&self) -> Option<BlockId> {
        if self.succs.len() == 1 {
            Some(self.succs[0])
        } else {
            None
        }
    }

    /// Returns the conditional successor of a two-successor block.
    ///
    /// # Arguments
    ///
    /// * `taken` - `true` for the branch-taken edge (first successor), `false` for the
    ///   fall-through edge (second successor)
    #[must_use]
    pub fn conditional_successor(&self, taken: bool) -> Option<BlockId> {
        if self.succs.len() == 2 {
            Some(self.succs[if taken { 0 } else { 1 }])
        } else {
            None
        }
    }

    /// Returns the branch info for the taken edge of a two-successor block.
    #[must_use]
    pub fn taken_branch_info(&self) -> BranchInfo {
        if self.branch_info.len() == 2 {
            self.branch_info[0]
        } else {
            BranchInfo::no_profile()
        }
    }

    /// Returns the branch info for the fall-through edge of a two-successor block.
    #[must_use]
    pub fn fallthrough_branch_info(&self) -> BranchInfo {
        if self.branch_info.len() == 2 {
            self.branch_info[1]
        } else {
            BranchInfo::no_profile()
        }
    }

    /// Returns the branch info for the edge to `succ`, if such an edge exists.
    #[must_use]
    pub fn branch_info_for(&self, succ: BlockId) -> Option<BranchInfo> {
        self.succs
            .iter()
            .position(|&s| s == succ)
            .map(|idx| self.branch_info[idx])
    }

    /// Returns taken and mispredict frequencies for the edge to `succ`.
    ///
    /// The taken frequency is the edge's taken count divided by the sum of all profiled
    /// outgoing counts; the mispredict frequency is relative to the edge's own taken count.
    /// Returns `None` when the edge or the block carries no usable profile.
    #[must_use]
    pub fn branch_stats(&self, succ: BlockId) -> Option<(f64, f64)> {
        let info = self.branch_info_for(succ)?;
        let taken = info.count.known()?;

        let mut total = 0u64;
        for bi in &self.branch_info {
            total = total.saturating_add(bi.count.known()?);
        }
        if total == 0 {
            return None;
        }

        let taken_freq = taken as f64 / total as f64;
        let mispred_freq = if taken > 0 {
            info.mispredicted.known_or_zero() as f64 / taken as f64
        } else {
            0.0
        };
        Some((taken_freq, mispred_freq))
    }

    /// Returns `true` if `succ` is a successor of this block.
    #[must_use]
    pub fn is_successor(&self, succ: BlockId) -> bool {
        self.succs.contains(&succ)
    }

    /// Returns the block's execution count.
    #[must_use]
    pub fn execution_count(&self) -> ExecCount {
        self.exec_count
    }

    /// Returns the execution count, treating missing profile data as zero.
    #[must_use]
    pub fn known_execution_count(&self) -> u64 {
        self.exec_count.known_or_zero()
    }

    /// Sets the block's execution count.
    pub fn set_execution_count(&mut self, count: ExecCount) {
        self.exec_count = count;
    }

    /// Returns `true` if the block carries profile data.
    #[must_use]
    pub fn has_profile(&self) -> bool {
        self.exec_count.is_profiled()
    }

    /// Returns `true` if the block is a function entry point.
    #[must_use]
    pub fn is_entry_point(&self) -> bool {
        self.is_entry
    }

    /// Marks the block as a function entry point.
    pub fn set_entry_point(&mut self, is_entry: bool) {
        self.is_entry = is_entry;
    }

    /// Returns `true` if the block is an exception landing pad.
    #[must_use]
    pub fn is_landing_pad(&self) -> bool {
        self.is_landing_pad
    }

    /// Marks the block as an exception landing pad.
    pub fn set_landing_pad(&mut self, is_landing_pad: bool) {
        self.is_landing_pad = is_landing_pad;
    }

    /// Returns the validity flag used for deferred removal.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Sets the validity flag. Invalid blocks are removed by the next sweep.
    pub fn mark_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Returns `true` once the block has been swept into a tombstone.
    #[must_use]
    pub fn is_erased(&self) -> bool {
        self.erased
    }

    /// Returns `true` if the terminating branch dispatches through a jump table.
    #[must_use]
    pub fn has_jump_table(&self) -> bool {
        self.has_jump_table
    }

    /// Marks the block as terminated by a jump-table dispatch.
    pub fn set_jump_table(&mut self, has: bool) {
        self.has_jump_table = has;
    }

    /// Returns the CFI state id at block entry.
    #[must_use]
    pub fn cfi_state(&self) -> i32 {
        self.cfi_state
    }

    /// Sets the CFI state id at block entry.
    pub fn set_cfi_state(&mut self, state: i32) {
        self.cfi_state = state;
    }

    /// Returns the offset of the block in the input binary.
    #[must_use]
    pub fn input_offset(&self) -> u64 {
        self.input_offset
    }

    /// Sets the offset of the block in the input binary.
    pub fn set_input_offset(&mut self, offset: u64) {
        self.input_offset = offset;
    }

    /// Appends an instruction to the block.
    pub fn add_instruction(&mut self, inst: Instruction) {
        self.instructions.push(inst);
    }

    /// Removes the instruction at `index`.
    pub fn erase_instruction(&mut self, index: usize) {
        self.instructions.remove(index);
    }

    /// Replaces the instruction at `index` with a sequence, returning the index of the last
    /// inserted instruction.
    pub fn replace_instruction(&mut self, index: usize, seq: Vec<Instruction>) -> usize {
        let count = seq.len();
        self.instructions.splice(index..=index, seq);
        index + count.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Operation;

    fn block() -> BasicBlock {
        BasicBlock::new(SymbolId::new(0))
    }

    #[test]
    fn test_non_pseudo_accessors() {
        use crate::cfg::PseudoKind;

        let mut bb = block();
        bb.add_instruction(Instruction::new(Operation::Pseudo(PseudoKind::Label)));
        bb.add_instruction(Instruction::new(Operation::Nop));
        bb.add_instruction(Instruction::new(Operation::Pseudo(PseudoKind::CfiRememberState)));

        assert_eq!(bb.num_non_pseudos(), 1);
        assert_eq!(bb.first_non_pseudo().unwrap().op, Operation::Nop);
        assert_eq!(bb.last_non_pseudo_index(), Some(1));
    }

    #[test]
    fn test_conditional_successor_requires_two_edges() {
        let mut bb = block();
        bb.succs.push(BlockId::new(1));
        bb.branch_info.push(BranchInfo::new(10, 0));
        assert!(bb.conditional_successor(true).is_none());
        assert_eq!(bb.successor(), Some(BlockId::new(1)));

        bb.succs.push(BlockId::new(2));
        bb.branch_info.push(BranchInfo::new(5, 0));
        assert_eq!(bb.conditional_successor(true), Some(BlockId::new(1)));
        assert_eq!(bb.conditional_successor(false), Some(BlockId::new(2)));
        assert!(bb.successor().is_none());
    }

    #[test]
    fn test_branch_stats() {
        let mut bb = block();
        bb.succs.push(BlockId::new(1));
        bb.branch_info.push(BranchInfo::new(75, 15));
        bb.succs.push(BlockId::new(2));
        bb.branch_info.push(BranchInfo::new(25, 0));

        let (taken, mispred) = bb.branch_stats(BlockId::new(1)).unwrap();
        assert!((taken - 0.75).abs() < f64::EPSILON);
        assert!((mispred - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_branch_stats_without_profile() {
        let mut bb = block();
        bb.succs.push(BlockId::new(1));
        bb.branch_info.push(BranchInfo::no_profile());
        assert!(bb.branch_stats(BlockId::new(1)).is_none());
    }
}
