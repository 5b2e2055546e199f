//! Lightweight code-size estimation, independent of final emission.
//!
//! Passes need byte sizes long before the real emitter runs: unreachable-block accounting,
//! in-place size-fit checking and cache-aware layout scoring all work on estimates. An
//! estimator instance is deliberately cheap to create; callers that measure throwaway code
//! (e.g. blocks about to be deleted) must request a fresh instance via
//! [`BinaryContext::create_independent_emitter`](crate::binary::BinaryContext::create_independent_emitter)
//! so shared assembler state cannot be corrupted.
//!
//! Estimation still touches the shared [`SymbolTable`]: emitted labels are marked defined and
//! branch targets registered, mirroring what a real emission would do. The emitter-state
//! cleanup pass resets those flags after passes that estimate in parallel.

use crate::{
    binary::SymbolTable,
    cfg::{AnnotationKind, BasicBlock, BinaryFunction, Instruction, Operation},
};

/// Estimates emitted code sizes without performing a real emission.
pub struct SizeEstimator<'a> {
    symbols: &'a SymbolTable,
}

impl<'a> SizeEstimator<'a> {
    /// Creates an estimator over the given symbol table.
    #[must_use]
    pub fn new(symbols: &'a SymbolTable) -> Self {
        SizeEstimator { symbols }
    }

    /// Estimates the emitted size of a single instruction in bytes.
    ///
    /// An explicit [`AnnotationKind::Size`] override always wins. Direct control transfers
    /// register their target symbol, as a real emission would.
    #[must_use]
    pub fn estimate_instruction(&self, inst: &Instruction) -> u64 {
        if let Some(size) = inst.annotations.get(AnnotationKind::Size) {
            return size;
        }

        if let Some(target) = inst.target {
            self.symbols.get(target).set_registered(true);
        }

        match inst.op {
            Operation::Branch { cond: Some(_) } => 6,
            Operation::Branch { cond: None } => 5,
            Operation::IndirectBranch => 3,
            Operation::Call => 5,
            Operation::IndirectCall => 3,
            Operation::Return { rep_prefix } => 1 + u64::from(rep_prefix),
            Operation::Nop => 1,
            Operation::Trap => 2,
            Operation::Cmp { .. } => 4,
            Operation::Load { .. } | Operation::Store { .. } => match inst.mem {
                Some(mem) if mem.pc_relative || mem.disp.unsigned_abs() > 0x7f => 7,
                _ => 4,
            },
            Operation::MoveImm { wide, .. } => {
                if wide {
                    10
                } else {
                    5
                }
            }
            Operation::Move { .. } => 3,
            Operation::RepMovs { .. } => 2,
            Operation::Pseudo(_) => 0,
        }
    }

    /// Estimates the emitted size of a block, defining its label on the way.
    #[must_use]
    pub fn estimate_block(&self, block: &BasicBlock) -> u64 {
        self.symbols.get(block.label()).set_defined(true);
        block
            .instructions()
            .iter()
            .map(|inst| self.estimate_instruction(inst))
            .sum()
    }

    /// Estimates the emitted sizes of a function's hot and cold fragments.
    ///
    /// # Returns
    ///
    /// `(hot_size, cold_size)` in bytes; `cold_size` is zero for unsplit functions.
    #[must_use]
    pub fn estimate_function(&self, function: &BinaryFunction) -> (u64, u64) {
        let hot = function
            .layout()
            .main_fragment()
            .iter()
            .map(|&id| self.estimate_block(function.block(id)))
            .sum();
        let cold = function
            .layout()
            .cold_fragment()
            .iter()
            .map(|&id| self.estimate_block(function.block(id)))
            .sum();
        (hot, cold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{CondCode, MemOperand};

    #[test]
    fn test_size_annotation_overrides_model() {
        let symbols = SymbolTable::new();
        let estimator = SizeEstimator::new(&symbols);

        let mut inst = Instruction::new(Operation::Nop);
        assert_eq!(estimator.estimate_instruction(&inst), 1);
        inst.annotations.set(AnnotationKind::Size, 15);
        assert_eq!(estimator.estimate_instruction(&inst), 15);
    }

    #[test]
    fn test_wide_immediate_is_larger() {
        let symbols = SymbolTable::new();
        let estimator = SizeEstimator::new(&symbols);

        let wide = Instruction::new(Operation::MoveImm { dst: 0, wide: true });
        let narrow = Instruction::new(Operation::MoveImm { dst: 0, wide: false });
        assert!(estimator.estimate_instruction(&wide) > estimator.estimate_instruction(&narrow));
    }

    #[test]
    fn test_memory_displacement_widens_encoding() {
        let symbols = SymbolTable::new();
        let estimator = SizeEstimator::new(&symbols);

        let near = Instruction {
            mem: Some(MemOperand {
                base: Some(0),
                disp: 8,
                pc_relative: false,
                symbol: None,
                width: 8,
            }),
            ..Instruction::new(Operation::Load { dst: 1 })
        };
        let far = Instruction {
            mem: Some(MemOperand {
                base: Some(0),
                disp: 0x1000,
                pc_relative: false,
                symbol: None,
                width: 8,
            }),
            ..Instruction::new(Operation::Load { dst: 1 })
        };
        assert!(estimator.estimate_instruction(&far) > estimator.estimate_instruction(&near));
    }

    #[test]
    fn test_estimation_dirties_symbol_state() {
        let symbols = SymbolTable::new();
        let target = symbols.intern("callee", None);
        let estimator = SizeEstimator::new(&symbols);

        let jump = Instruction::with_target(Operation::Branch { cond: Some(CondCode::Eq) }, target);
        estimator.estimate_instruction(&jump);
        assert!(symbols.get(target).is_registered());
    }
}
