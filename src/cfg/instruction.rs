//! Machine instruction representation for the pass pipeline.
//!
//! Instructions are deliberately opaque to the passes: all classification and rewriting goes
//! through the [`InstructionSemantics`](crate::isa::InstructionSemantics) oracle, never through
//! direct matching on [`Operation`]. The representation here carries just enough structure for
//! a target layer to answer classification queries and perform in-place rewrites.
//!
//! # Annotations
//!
//! Instructions can carry sparse side-table annotations keyed by a closed set of
//! [`AnnotationKind`]s. Annotations survive rewrites that change an instruction's form but not
//! its semantic role (e.g. a conditional branch rewritten into a conditional tail call keeps
//! its original input offset).

use crate::binary::SymbolId;

/// Condition code of a conditional branch.
///
/// `CountZero` models the register-count branches (`jrcxz`-style) whose condition cannot be
/// reversed; the target layer classifies such branches as dynamic and branch analysis refuses
/// to touch them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondCode {
    /// Equal / zero.
    Eq,
    /// Not equal / not zero.
    Ne,
    /// Signed less than.
    Lt,
    /// Signed greater or equal.
    Ge,
    /// Signed greater than.
    Gt,
    /// Signed less or equal.
    Le,
    /// Unsigned above.
    Above,
    /// Unsigned below.
    Below,
    /// Count register is zero; not reversible.
    CountZero,
}

impl CondCode {
    /// Returns the inverted condition, or `None` for conditions that cannot be reversed.
    #[must_use]
    pub fn inverted(self) -> Option<CondCode> {
        match self {
            CondCode::Eq => Some(CondCode::Ne),
            CondCode::Ne => Some(CondCode::Eq),
            CondCode::Lt => Some(CondCode::Ge),
            CondCode::Ge => Some(CondCode::Lt),
            CondCode::Gt => Some(CondCode::Le),
            CondCode::Le => Some(CondCode::Gt),
            CondCode::Above => Some(CondCode::Below),
            CondCode::Below => Some(CondCode::Above),
            CondCode::CountZero => None,
        }
    }
}

/// A general-purpose register identifier, assigned by the target layer.
pub type Reg = u8;

/// A memory operand of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    /// Base register, if any. `None` with `pc_relative == false` means an absolute address.
    pub base: Option<Reg>,
    /// Displacement added to the base (or the absolute address itself).
    pub disp: i64,
    /// Whether the displacement is PC-relative via a symbolic reference.
    pub pc_relative: bool,
    /// Symbol referenced by a PC-relative displacement.
    pub symbol: Option<SymbolId>,
    /// Access width in bytes (1, 2, 4 or 8).
    pub width: u8,
}

/// Pseudo instruction kinds that occupy no bytes in the emitted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoKind {
    /// Call-frame-information directive restoring a saved unwind state.
    CfiRestoreState,
    /// Call-frame-information directive remembering the current unwind state.
    CfiRememberState,
    /// A label-only marker.
    Label,
}

/// The operation performed by an instruction.
///
/// Passes never match on this directly; it exists for the target layer to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Direct branch; conditional when `cond` is set. The target lives in
    /// [`Instruction::target`].
    Branch {
        /// Condition code, `None` for unconditional branches.
        cond: Option<CondCode>,
    },
    /// Branch through a register or jump table.
    IndirectBranch,
    /// Direct call to [`Instruction::target`].
    Call,
    /// Call through a register.
    IndirectCall,
    /// Return to caller.
    Return {
        /// Whether the return carries a legacy `rep` prefix.
        rep_prefix: bool,
    },
    /// Architectural no-op.
    Nop,
    /// Undefined-instruction trap.
    Trap,
    /// Compare a register against [`Instruction::imm`].
    Cmp {
        /// Register operand.
        reg: Reg,
    },
    /// Load from [`Instruction::mem`] into a register.
    Load {
        /// Destination register.
        dst: Reg,
    },
    /// Store a register to [`Instruction::mem`].
    Store {
        /// Source register.
        src: Reg,
    },
    /// Move an immediate into a register; `wide` selects the 64-bit encoding.
    MoveImm {
        /// Destination register.
        dst: Reg,
        /// Whether the full-width immediate encoding is used.
        wide: bool,
    },
    /// Register-to-register move.
    Move {
        /// Destination register.
        dst: Reg,
        /// Source register.
        src: Reg,
    },
    /// Repeated string copy (`rep movs`-style) moving `width`-byte units.
    RepMovs {
        /// Unit width in bytes.
        width: u8,
    },
    /// Zero-size pseudo instruction.
    Pseudo(PseudoKind),
}

/// Side-table annotation keys.
///
/// The set is closed and enumerable by design; passes attach values under these keys instead
/// of growing the instruction struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AnnotationKind {
    /// Original input offset of the instruction, preserved across rewrites.
    Offset,
    /// Explicit emitted-size override; instructions carrying it are never shortened.
    Size,
    /// Marks a jump as a tail call.
    TailCall,
    /// Marks a conditional branch as a conditional tail call.
    ConditionalTailCall,
    /// Taken count transferred from a removed edge when a conditional tail call is formed.
    CtcTakenCount,
    /// Marks a no-op as removable padding inserted by instrumentation.
    NopPadding,
}

/// Sparse annotation storage, sorted by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations(Vec<(AnnotationKind, u64)>);

impl Annotations {
    /// Returns the value stored under `kind`, if any.
    #[must_use]
    pub fn get(&self, kind: AnnotationKind) -> Option<u64> {
        self.0
            .binary_search_by_key(&kind, |&(k, _)| k)
            .ok()
            .map(|idx| self.0[idx].1)
    }

    /// Stores `value` under `kind`, replacing any previous value.
    pub fn set(&mut self, kind: AnnotationKind, value: u64) {
        match self.0.binary_search_by_key(&kind, |&(k, _)| k) {
            Ok(idx) => self.0[idx].1 = value,
            Err(idx) => self.0.insert(idx, (kind, value)),
        }
    }

    /// Removes the annotation under `kind`, returning its previous value.
    pub fn remove(&mut self, kind: AnnotationKind) -> Option<u64> {
        self.0
            .binary_search_by_key(&kind, |&(k, _)| k)
            .ok()
            .map(|idx| self.0.remove(idx).1)
    }

    /// Returns `true` if an annotation is present under `kind`.
    #[must_use]
    pub fn contains(&self, kind: AnnotationKind) -> bool {
        self.get(kind).is_some()
    }
}

/// A single machine instruction.
///
/// # Examples
///
/// ```rust
/// use reforge::cfg::{AnnotationKind, Instruction, Operation};
///
/// let mut inst = Instruction::new(Operation::Nop);
/// inst.annotations.set(AnnotationKind::NopPadding, 1);
/// assert!(inst.annotations.contains(AnnotationKind::NopPadding));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The operation performed.
    pub op: Operation,
    /// Branch or call target symbol, for direct control transfers.
    pub target: Option<SymbolId>,
    /// Memory operand, for loads and stores.
    pub mem: Option<MemOperand>,
    /// Immediate operand.
    pub imm: Option<i64>,
    /// Sparse side-table annotations.
    pub annotations: Annotations,
}

impl Instruction {
    /// Creates an instruction with no operands or annotations.
    #[must_use]
    pub fn new(op: Operation) -> Self {
        Instruction {
            op,
            target: None,
            mem: None,
            imm: None,
            annotations: Annotations::default(),
        }
    }

    /// Creates an instruction with a direct control-transfer target.
    #[must_use]
    pub fn with_target(op: Operation, target: SymbolId) -> Self {
        Instruction {
            op,
            target: Some(target),
            mem: None,
            imm: None,
            annotations: Annotations::default(),
        }
    }

    /// Returns `true` for zero-size pseudo instructions.
    #[must_use]
    pub fn is_pseudo(&self) -> bool {
        matches!(self.op, Operation::Pseudo(_))
    }
}
