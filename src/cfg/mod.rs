//! Control-flow-graph data model for machine functions.
//!
//! This module provides the per-function representation the pass pipeline operates on:
//!
//! - [`BinaryFunction`] - a block arena plus layout, flags and unwind state
//! - [`BasicBlock`] - instruction sequence with profiled predecessor/successor edges
//! - [`Instruction`] - opaque machine instruction with sparse annotations
//! - [`FunctionLayout`] - emission order, fragments, edit distance
//! - [`ExecCount`] / [`BranchInfo`] - profile counts with an explicit no-profile sentinel
//!
//! Functions own their blocks exclusively; during a pass, a worker thread checks a function
//! out of the [`BinaryContext`](crate::binary::BinaryContext) registry, mutates it with no
//! locks held, and checks it back in.

mod block;
mod count;
mod function;
mod instruction;
mod layout;

pub use block::{BasicBlock, BlockId};
pub use count::{BranchInfo, ExecCount};
pub use function::{BinaryFunction, BranchAnalysis, ExceptionRange};
pub use instruction::{
    AnnotationKind, Annotations, CondCode, Instruction, MemOperand, Operation, PseudoKind, Reg,
};
pub use layout::FunctionLayout;
