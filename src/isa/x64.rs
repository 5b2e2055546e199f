//! x86-64 instruction semantics.
//!
//! Implements the [`InstructionSemantics`] oracle over the opaque operation model. Tail calls
//! are jumps carrying a `TailCall` annotation; conditional tail calls are conditional branches
//! carrying a `ConditionalTailCall` annotation, and classify as calls from that point on.

use crate::{
    binary::SymbolId,
    cfg::{AnnotationKind, CondCode, Instruction, MemOperand, Operation, Reg},
    isa::InstructionSemantics,
};

/// System V x86-64 integer argument registers, in call-convention order.
const INT_ARG_REGISTERS: [Reg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// `%rcx` register number.
pub const RCX: Reg = 1;
/// `%rdx` register number.
pub const RDX: Reg = 2;
/// `%rsi` register number.
pub const RSI: Reg = 6;
/// `%rdi` register number.
pub const RDI: Reg = 7;
/// `%r8` register number.
pub const R8: Reg = 8;
/// `%r9` register number.
pub const R9: Reg = 9;
/// `%r11`, the scratch register used by inline copy sequences.
pub const R11: Reg = 11;

/// x86-64 target layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct X64;

impl X64 {
    /// Creates the x86-64 semantics oracle.
    #[must_use]
    pub fn new() -> Self {
        X64
    }
}

impl InstructionSemantics for X64 {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn supports_conditional_tail_calls(&self) -> bool {
        true
    }

    fn supports_instruction_shortening(&self) -> bool {
        true
    }

    fn supports_inline_memcpy(&self) -> bool {
        true
    }

    fn supports_rep_prefix(&self) -> bool {
        true
    }

    fn is_call(&self, inst: &Instruction) -> bool {
        // Tail calls are calls: jumps annotated as such classify the way real calls do.
        matches!(inst.op, Operation::Call | Operation::IndirectCall)
            || inst.annotations.contains(AnnotationKind::TailCall)
            || inst.annotations.contains(AnnotationKind::ConditionalTailCall)
    }

    fn is_indirect_call(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::IndirectCall)
    }

    fn is_branch(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::Branch { .. } | Operation::IndirectBranch)
    }

    fn is_unconditional_branch(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::Branch { cond: None })
    }

    fn is_conditional_branch(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::Branch { cond: Some(_) })
    }

    fn is_indirect_branch(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::IndirectBranch)
    }

    fn is_dynamic_branch(&self, inst: &Instruction) -> bool {
        matches!(
            inst.op,
            Operation::Branch {
                cond: Some(CondCode::CountZero)
            }
        )
    }

    fn is_tail_call(&self, inst: &Instruction) -> bool {
        inst.annotations.contains(AnnotationKind::TailCall)
            || inst.annotations.contains(AnnotationKind::ConditionalTailCall)
    }

    fn is_return(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::Return { .. })
    }

    fn is_noop(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::Nop)
    }

    fn is_trap(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::Trap)
    }

    fn may_load(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::Load { .. } | Operation::RepMovs { .. })
    }

    fn may_store(&self, inst: &Instruction) -> bool {
        matches!(inst.op, Operation::Store { .. } | Operation::RepMovs { .. })
    }

    fn has_pc_rel_operand(&self, inst: &Instruction) -> bool {
        inst.mem.is_some_and(|mem| mem.pc_relative)
    }

    fn target_symbol(&self, inst: &Instruction) -> Option<SymbolId> {
        inst.target
    }

    fn replace_branch_target(&self, inst: &mut Instruction, target: SymbolId) {
        inst.target = Some(target);
    }

    fn reverse_branch_condition(&self, inst: &mut Instruction, target: SymbolId) -> bool {
        let Operation::Branch { cond: Some(cond) } = inst.op else {
            return false;
        };
        let Some(inverted) = cond.inverted() else {
            return false;
        };
        inst.op = Operation::Branch { cond: Some(inverted) };
        inst.target = Some(target);
        true
    }

    fn set_conditional_tail_call(&self, inst: &mut Instruction) {
        inst.annotations.set(AnnotationKind::ConditionalTailCall, 1);
    }

    fn create_uncond_branch(&self, target: SymbolId) -> Instruction {
        Instruction::with_target(Operation::Branch { cond: None }, target)
    }

    fn create_tail_call(&self, target: SymbolId) -> Instruction {
        let mut inst = Instruction::with_target(Operation::Branch { cond: None }, target);
        inst.annotations.set(AnnotationKind::TailCall, 1);
        inst
    }

    fn create_trap(&self) -> Instruction {
        Instruction::new(Operation::Trap)
    }

    fn create_return(&self) -> Instruction {
        Instruction::new(Operation::Return { rep_prefix: false })
    }

    fn create_cmp_je(&self, reg: Reg, imm: i64, target: SymbolId) -> Vec<Instruction> {
        let mut cmp = Instruction::new(Operation::Cmp { reg });
        cmp.imm = Some(imm);
        let branch = Instruction::with_target(
            Operation::Branch {
                cond: Some(CondCode::Eq),
            },
            target,
        );
        vec![cmp, branch]
    }

    fn create_inline_memcpy(&self, eight_byte: bool) -> Vec<Instruction> {
        if eight_byte {
            // Fixed-size variant: one 8-byte load/store pair through the scratch register.
            let load = Instruction {
                mem: Some(MemOperand {
                    base: Some(RSI),
                    disp: 0,
                    pc_relative: false,
                    symbol: None,
                    width: 8,
                }),
                ..Instruction::new(Operation::Load { dst: R11 })
            };
            let store = Instruction {
                mem: Some(MemOperand {
                    base: Some(RDI),
                    disp: 0,
                    pc_relative: false,
                    symbol: None,
                    width: 8,
                }),
                ..Instruction::new(Operation::Store { src: R11 })
            };
            vec![load, store]
        } else {
            // General variant: move the size into the count register, then rep movsb.
            vec![
                Instruction::new(Operation::Move { dst: RCX, src: RDX }),
                Instruction::new(Operation::RepMovs { width: 1 }),
            ]
        }
    }

    fn create_one_byte_memcpy(&self) -> Vec<Instruction> {
        let load = Instruction {
            mem: Some(MemOperand {
                base: Some(RSI),
                disp: 0,
                pc_relative: false,
                symbol: None,
                width: 1,
            }),
            ..Instruction::new(Operation::Load { dst: R11 })
        };
        let store = Instruction {
            mem: Some(MemOperand {
                base: Some(RDI),
                disp: 0,
                pc_relative: false,
                symbol: None,
                width: 1,
            }),
            ..Instruction::new(Operation::Store { src: R11 })
        };
        vec![load, store]
    }

    fn int_arg_register(&self, index: usize) -> Reg {
        INT_ARG_REGISTERS[index]
    }

    fn shorten_instruction(&self, inst: &mut Instruction) -> bool {
        let Operation::MoveImm { dst, wide: true } = inst.op else {
            return false;
        };
        let imm = inst.imm.unwrap_or(0);
        if i32::try_from(imm).is_err() {
            return false;
        }
        inst.op = Operation::MoveImm { dst, wide: false };
        true
    }

    fn evaluate_mem_operand_target(&self, inst: &Instruction) -> Option<u64> {
        let mem = inst.mem?;
        if mem.pc_relative || mem.base.is_some() {
            return None;
        }
        u64::try_from(mem.disp).ok()
    }

    fn mem_operand_symbol(&self, inst: &Instruction) -> Option<(SymbolId, i64)> {
        let mem = inst.mem?;
        if !mem.pc_relative {
            return None;
        }
        mem.symbol.map(|sym| (sym, mem.disp))
    }

    fn replace_mem_operand_with_imm(
        &self,
        inst: &mut Instruction,
        data: &[u8],
        offset: usize,
    ) -> bool {
        let Operation::Load { dst } = inst.op else {
            return false;
        };
        let Some(mem) = inst.mem else {
            return false;
        };
        let width = usize::from(mem.width);
        let Some(bytes) = data.get(offset..offset + width) else {
            return false;
        };

        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(bytes);
        let value = i64::from_le_bytes(raw);

        inst.op = Operation::MoveImm {
            dst,
            wide: mem.width == 8 && i32::try_from(value).is_err(),
        };
        inst.mem = None;
        inst.imm = Some(value);
        true
    }

    fn remove_rep_prefix(&self, inst: &mut Instruction) -> bool {
        if inst.op == (Operation::Return { rep_prefix: true }) {
            inst.op = Operation::Return { rep_prefix: false };
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_call_classification() {
        let isa = X64::new();
        let mut jump = isa.create_uncond_branch(SymbolId::new(0));
        assert!(!isa.is_tail_call(&jump));
        jump.annotations.set(AnnotationKind::TailCall, 1);
        assert!(isa.is_tail_call(&jump));
        assert!(isa.is_unconditional_branch(&jump));
    }

    #[test]
    fn test_conditional_tail_call_classifies_as_call() {
        let isa = X64::new();
        let mut jcc = Instruction::with_target(
            Operation::Branch {
                cond: Some(CondCode::Ne),
            },
            SymbolId::new(3),
        );
        assert!(!isa.is_call(&jcc));
        isa.set_conditional_tail_call(&mut jcc);
        assert!(isa.is_call(&jcc));
        assert!(isa.is_tail_call(&jcc));
        assert!(isa.is_conditional_branch(&jcc));
    }

    #[test]
    fn test_reverse_branch_condition() {
        let isa = X64::new();
        let mut jcc = Instruction::with_target(
            Operation::Branch {
                cond: Some(CondCode::Eq),
            },
            SymbolId::new(1),
        );
        assert!(isa.reverse_branch_condition(&mut jcc, SymbolId::new(9)));
        assert_eq!(
            jcc.op,
            Operation::Branch {
                cond: Some(CondCode::Ne)
            }
        );
        assert_eq!(jcc.target, Some(SymbolId::new(9)));

        let mut jrcxz = Instruction::with_target(
            Operation::Branch {
                cond: Some(CondCode::CountZero),
            },
            SymbolId::new(1),
        );
        assert!(!isa.reverse_branch_condition(&mut jrcxz, SymbolId::new(9)));
        assert_eq!(jrcxz.target, Some(SymbolId::new(1)));
    }

    #[test]
    fn test_shorten_wide_immediate() {
        let isa = X64::new();
        let mut mov = Instruction::new(Operation::MoveImm { dst: 0, wide: true });
        mov.imm = Some(42);
        assert!(isa.shorten_instruction(&mut mov));
        assert_eq!(mov.op, Operation::MoveImm { dst: 0, wide: false });

        let mut big = Instruction::new(Operation::MoveImm { dst: 0, wide: true });
        big.imm = Some(i64::MAX);
        assert!(!isa.shorten_instruction(&mut big));
    }

    #[test]
    fn test_replace_mem_operand_with_imm() {
        let isa = X64::new();
        let mut load = Instruction {
            mem: Some(MemOperand {
                base: None,
                disp: 0x2004,
                pc_relative: false,
                symbol: None,
                width: 4,
            }),
            ..Instruction::new(Operation::Load { dst: 3 })
        };

        let data = [0u8, 0, 0, 0, 0x2a, 0, 0, 0];
        assert!(isa.replace_mem_operand_with_imm(&mut load, &data, 4));
        assert_eq!(load.imm, Some(0x2a));
        assert_eq!(load.op, Operation::MoveImm { dst: 3, wide: false });
        assert!(load.mem.is_none());
    }

    #[test]
    fn test_evaluate_absolute_mem_operand() {
        let isa = X64::new();
        let load = Instruction {
            mem: Some(MemOperand {
                base: None,
                disp: 0x7000,
                pc_relative: false,
                symbol: None,
                width: 8,
            }),
            ..Instruction::new(Operation::Load { dst: 0 })
        };
        assert_eq!(isa.evaluate_mem_operand_target(&load), Some(0x7000));
    }

    #[test]
    fn test_rep_prefix_removal() {
        let isa = X64::new();
        let mut ret = Instruction::new(Operation::Return { rep_prefix: true });
        assert!(isa.remove_rep_prefix(&mut ret));
        assert!(!isa.remove_rep_prefix(&mut ret));
    }
}
