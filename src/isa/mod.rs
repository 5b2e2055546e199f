//! Architecture-specific instruction semantics.
//!
//! Passes never inspect [`Instruction`](crate::cfg::Instruction) internals directly. All
//! classification, branch-target surgery and instruction creation goes through the
//! [`InstructionSemantics`] oracle, keeping the pipeline portable across targets: a pass asks
//! "is this a tail call?" and the target layer answers.
//!
//! Capability queries (`supports_*`) replicate the architecture gates of the optimizer:
//! passes whose idiom only exists on one target are a no-op elsewhere.

mod x64;

pub use x64::X64;

use crate::{
    binary::SymbolId,
    cfg::{Instruction, Reg},
};

/// Classification and rewriting oracle for machine instructions.
///
/// Implementations must be stateless or internally synchronized: the oracle is shared across
/// worker threads and queried concurrently during parallel passes.
pub trait InstructionSemantics: Send + Sync {
    /// Human-readable architecture name.
    fn name(&self) -> &'static str;

    // ── Capability gates ────────────────────────────────────────────────

    /// Whether the target encodes conditional tail calls.
    fn supports_conditional_tail_calls(&self) -> bool;

    /// Whether the target layer can shorten instruction encodings.
    fn supports_instruction_shortening(&self) -> bool;

    /// Whether the target layer provides inline memcpy sequences.
    fn supports_inline_memcpy(&self) -> bool;

    /// Whether returns may carry a removable legacy `rep` prefix.
    fn supports_rep_prefix(&self) -> bool;

    // ── Classification ──────────────────────────────────────────────────

    /// Returns `true` for calls, including branches annotated as conditional tail calls.
    fn is_call(&self, inst: &Instruction) -> bool;

    /// Returns `true` for calls through a register.
    fn is_indirect_call(&self, inst: &Instruction) -> bool;

    /// Returns `true` for any branch instruction.
    fn is_branch(&self, inst: &Instruction) -> bool;

    /// Returns `true` for direct unconditional branches.
    fn is_unconditional_branch(&self, inst: &Instruction) -> bool;

    /// Returns `true` for direct conditional branches.
    fn is_conditional_branch(&self, inst: &Instruction) -> bool;

    /// Returns `true` for branches through a register or jump table.
    fn is_indirect_branch(&self, inst: &Instruction) -> bool;

    /// Returns `true` for conditional branches whose condition cannot be reversed.
    fn is_dynamic_branch(&self, inst: &Instruction) -> bool;

    /// Returns `true` for tail calls, direct or conditional.
    fn is_tail_call(&self, inst: &Instruction) -> bool;

    /// Returns `true` for returns.
    fn is_return(&self, inst: &Instruction) -> bool;

    /// Returns `true` for architectural no-ops.
    fn is_noop(&self, inst: &Instruction) -> bool;

    /// Returns `true` for trap instructions.
    fn is_trap(&self, inst: &Instruction) -> bool;

    /// Returns `true` if the instruction may read memory.
    fn may_load(&self, inst: &Instruction) -> bool;

    /// Returns `true` if the instruction may write memory.
    fn may_store(&self, inst: &Instruction) -> bool;

    /// Returns `true` if the instruction has a PC-relative memory operand.
    fn has_pc_rel_operand(&self, inst: &Instruction) -> bool;

    // ── Branch targets ──────────────────────────────────────────────────

    /// Returns the direct control-transfer target, if any.
    fn target_symbol(&self, inst: &Instruction) -> Option<SymbolId>;

    /// Redirects a direct control transfer to `target`.
    fn replace_branch_target(&self, inst: &mut Instruction, target: SymbolId);

    /// Inverts the condition of a conditional branch and redirects it to `target`.
    ///
    /// # Returns
    ///
    /// `false` when the condition is not reversible; the instruction is left untouched.
    fn reverse_branch_condition(&self, inst: &mut Instruction, target: SymbolId) -> bool;

    /// Marks a conditional branch as a conditional tail call.
    fn set_conditional_tail_call(&self, inst: &mut Instruction);

    // ── Factories ───────────────────────────────────────────────────────

    /// Creates a direct unconditional branch to `target`.
    fn create_uncond_branch(&self, target: SymbolId) -> Instruction;

    /// Creates a direct tail call to `target`.
    fn create_tail_call(&self, target: SymbolId) -> Instruction;

    /// Creates a trap instruction.
    fn create_trap(&self) -> Instruction;

    /// Creates a return instruction.
    fn create_return(&self) -> Instruction;

    /// Creates a compare-immediate-and-branch-if-equal sequence.
    fn create_cmp_je(&self, reg: Reg, imm: i64, target: SymbolId) -> Vec<Instruction>;

    /// Creates the inline expansion of a general memcpy call.
    ///
    /// # Arguments
    ///
    /// * `eight_byte` - Use the fixed 8-byte variant instead of the general copy loop
    fn create_inline_memcpy(&self, eight_byte: bool) -> Vec<Instruction>;

    /// Creates the specialized single-byte copy sequence.
    fn create_one_byte_memcpy(&self) -> Vec<Instruction>;

    /// Returns the register carrying the `index`-th integer call argument.
    fn int_arg_register(&self, index: usize) -> Reg;

    // ── In-place rewrites ───────────────────────────────────────────────

    /// Replaces the instruction with an equivalent shorter encoding, when one exists.
    ///
    /// # Returns
    ///
    /// `true` if the instruction was shortened.
    fn shorten_instruction(&self, inst: &mut Instruction) -> bool;

    /// Statically evaluates a non-symbolic memory-operand address.
    fn evaluate_mem_operand_target(&self, inst: &Instruction) -> Option<u64>;

    /// Returns the symbol and displacement of a PC-relative memory operand.
    fn mem_operand_symbol(&self, inst: &Instruction) -> Option<(SymbolId, i64)>;

    /// Replaces a load's memory operand with the immediate value read from section bytes.
    ///
    /// # Arguments
    ///
    /// * `inst` - The load instruction to rewrite
    /// * `data` - Contents of the section containing the loaded address
    /// * `offset` - Offset of the loaded value within `data`
    ///
    /// # Returns
    ///
    /// `true` if the operand was replaced.
    fn replace_mem_operand_with_imm(
        &self,
        inst: &mut Instruction,
        data: &[u8],
        offset: usize,
    ) -> bool;

    /// Deletes a legacy `rep` prefix from a return.
    ///
    /// # Returns
    ///
    /// `true` if a prefix was present and removed.
    fn remove_rep_prefix(&self, inst: &mut Instruction) -> bool;
}
