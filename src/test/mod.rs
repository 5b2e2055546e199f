//! Shared test factories.
//!
//! [`FunctionBuilder`] assembles [`BinaryFunction`]s declaratively for unit and integration
//! tests: blocks are declared in layout order, terminators imply successor edges, and branch
//! weights attach to the edges they describe.
//!
//! ```rust,ignore
//! let f = FunctionBuilder::new("example", 0x1000)
//!     .block(|b| b.exec(100).cond(CondCode::Eq, 2, 1).counts(90, 10))
//!     .block(|b| b.exec(10).jump(3))
//!     .block(|b| b.exec(90).jump(3))
//!     .block(|b| b.exec(100).ret())
//!     .build();
//! ```

use std::sync::{Arc, Mutex};

use crate::{
    binary::{BinaryContext, FunctionId, SymbolTable},
    cfg::{
        AnnotationKind, BinaryFunction, BlockId, BranchInfo, CondCode, ExecCount, Instruction,
        MemOperand, Operation, Reg,
    },
    config::OptConfig,
    isa::X64,
    report::ReportSink,
};

/// Creates a context over the x86-64 target with silenced reporting.
pub(crate) fn test_context() -> BinaryContext {
    test_context_with(OptConfig::default())
}

/// Creates a silenced context with the given configuration.
pub(crate) fn test_context_with(opts: OptConfig) -> BinaryContext {
    let mut ctx = BinaryContext::new(Box::new(X64::new()), opts);
    ctx.set_sink(ReportSink::sink());
    ctx
}

/// Creates a context whose report output is captured in a buffer.
pub(crate) fn test_context_buffered() -> (BinaryContext, Arc<Mutex<Vec<u8>>>) {
    test_context_with_buffered(OptConfig::default())
}

/// Creates a buffered-output context with the given configuration.
pub(crate) fn test_context_with_buffered(
    opts: OptConfig,
) -> (BinaryContext, Arc<Mutex<Vec<u8>>>) {
    let mut ctx = BinaryContext::new(Box::new(X64::new()), opts);
    let (sink, buffer) = ReportSink::buffered();
    ctx.set_sink(sink);
    (ctx, buffer)
}

/// Reads captured report output as a string.
pub(crate) fn sink_text(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&buffer.lock().unwrap()).into_owned()
}

enum PreInst {
    Real(Instruction),
    Jump(usize),
    Cond(CondCode, usize),
    TailCall(String),
    IndirectTailCall,
    Call(String),
    LoadAbs(Reg, u64, u8),
    LoadSym(Reg, String, i64, u8),
    JumpTable,
    Ret,
}

/// Declarative block description collected by [`FunctionBuilder::block`].
#[derive(Default)]
pub(crate) struct BlockBuilder {
    insts: Vec<PreInst>,
    edges: Vec<(usize, BranchInfo)>,
    exec: Option<u64>,
    cfi: i32,
    landing_pad: bool,
    entry: bool,
}

impl BlockBuilder {
    /// Sets the block execution count.
    pub(crate) fn exec(mut self, count: u64) -> Self {
        self.exec = Some(count);
        self
    }

    /// Sets the CFI state at block entry.
    pub(crate) fn cfi_state(mut self, state: i32) -> Self {
        self.cfi = state;
        self
    }

    /// Marks the block as an exception landing pad.
    pub(crate) fn landing_pad(mut self) -> Self {
        self.landing_pad = true;
        self
    }

    /// Marks the block as an additional entry point.
    pub(crate) fn entry(mut self) -> Self {
        self.entry = true;
        self
    }

    /// Terminates the block with an unconditional jump to block `target`.
    pub(crate) fn jump(mut self, target: usize) -> Self {
        self.insts.push(PreInst::Jump(target));
        self.edges.push((target, BranchInfo::no_profile()));
        self
    }

    /// Terminates the block with a conditional branch: `taken` on true, `fallthrough`
    /// otherwise.
    pub(crate) fn cond(mut self, cond: CondCode, taken: usize, fallthrough: usize) -> Self {
        self.insts.push(PreInst::Cond(cond, taken));
        self.edges = vec![
            (taken, BranchInfo::no_profile()),
            (fallthrough, BranchInfo::no_profile()),
        ];
        self
    }

    /// Attaches taken counts to the two edges of a conditional terminator.
    pub(crate) fn counts(mut self, taken: u64, fallthrough: u64) -> Self {
        assert_eq!(self.edges.len(), 2, "counts() needs a conditional terminator");
        self.edges[0].1.count = ExecCount::new(taken);
        self.edges[1].1.count = ExecCount::new(fallthrough);
        self
    }

    /// Attaches mispredict counts to the two edges of a conditional terminator.
    pub(crate) fn mispredicts(mut self, taken: u64, fallthrough: u64) -> Self {
        assert_eq!(
            self.edges.len(),
            2,
            "mispredicts() needs a conditional terminator"
        );
        self.edges[0].1.mispredicted = ExecCount::new(taken);
        self.edges[1].1.mispredicted = ExecCount::new(fallthrough);
        self
    }

    /// Attaches a taken count to the single edge of the block.
    pub(crate) fn count(mut self, count: u64) -> Self {
        assert_eq!(self.edges.len(), 1, "count() needs exactly one edge");
        self.edges[0].1.count = ExecCount::new(count);
        self
    }

    /// Terminates the block with a return.
    pub(crate) fn ret(mut self) -> Self {
        self.insts.push(PreInst::Ret);
        self
    }

    /// Terminates the block with a direct tail call to `callee`.
    pub(crate) fn tail_call(mut self, callee: &str) -> Self {
        self.insts.push(PreInst::TailCall(callee.to_string()));
        self
    }

    /// Terminates the block with an indirect tail call.
    pub(crate) fn indirect_tail_call(mut self) -> Self {
        self.insts.push(PreInst::IndirectTailCall);
        self
    }

    /// Terminates the block with an indirect jump-table dispatch to `targets`.
    pub(crate) fn jump_table(mut self, targets: &[usize]) -> Self {
        self.insts.push(PreInst::JumpTable);
        for &target in targets {
            self.edges.push((target, BranchInfo::no_profile()));
        }
        self
    }

    /// Leaves the block empty but falling through to `target`.
    pub(crate) fn empty_with_successor(mut self, target: usize) -> Self {
        self.edges.push((target, BranchInfo::no_profile()));
        self
    }

    /// Leaves the block completely empty, with no edges.
    pub(crate) fn empty_block(self) -> Self {
        self
    }

    /// Appends a plain no-op.
    pub(crate) fn push_nop(mut self) -> Self {
        self.insts.push(PreInst::Real(Instruction::new(Operation::Nop)));
        self
    }

    /// Appends a no-op annotated as removable padding.
    pub(crate) fn push_padding_nop(mut self) -> Self {
        let mut nop = Instruction::new(Operation::Nop);
        nop.annotations.set(AnnotationKind::NopPadding, 1);
        self.insts.push(PreInst::Real(nop));
        self
    }

    /// Appends a direct call to `callee`.
    pub(crate) fn push_call(mut self, callee: &str) -> Self {
        self.insts.push(PreInst::Call(callee.to_string()));
        self
    }

    /// Appends a load from an absolute address.
    pub(crate) fn push_load_abs(mut self, dst: Reg, address: u64, width: u8) -> Self {
        self.insts.push(PreInst::LoadAbs(dst, address, width));
        self
    }

    /// Appends a PC-relative load through a named symbol.
    pub(crate) fn push_load_sym(mut self, dst: Reg, symbol: &str, disp: i64, width: u8) -> Self {
        self.insts
            .push(PreInst::LoadSym(dst, symbol.to_string(), disp, width));
        self
    }

    /// Appends an arbitrary instruction.
    pub(crate) fn push(mut self, inst: Instruction) -> Self {
        self.insts.push(PreInst::Real(inst));
        self
    }
}

/// Declarative factory for [`BinaryFunction`]s.
pub(crate) struct FunctionBuilder {
    name: String,
    address: u64,
    blocks: Vec<BlockBuilder>,
}

impl FunctionBuilder {
    /// Starts a function at `address`.
    pub(crate) fn new(name: impl Into<String>, address: u64) -> Self {
        FunctionBuilder {
            name: name.into(),
            address,
            blocks: Vec::new(),
        }
    }

    /// Declares the next block in layout order.
    pub(crate) fn block<F>(mut self, build: F) -> Self
    where
        F: FnOnce(BlockBuilder) -> BlockBuilder,
    {
        self.blocks.push(build(BlockBuilder::default()));
        self
    }

    /// Builds a standalone function with a private symbol table.
    pub(crate) fn build(self) -> BinaryFunction {
        let symbols = SymbolTable::new();
        self.build_with_symbols(&symbols)
    }

    /// Builds the function against a context and registers it.
    pub(crate) fn build_into(self, ctx: &BinaryContext) -> FunctionId {
        let function = self.build_with_symbols(&ctx.symbols);
        ctx.add_function(function)
    }

    fn build_with_symbols(self, symbols: &SymbolTable) -> BinaryFunction {
        let mut function = BinaryFunction::new(self.name.clone(), self.address);

        let labels: Vec<_> = (0..self.blocks.len())
            .map(|idx| symbols.intern(&format!("{}.bb{idx}", self.name), None))
            .collect();
        for label in &labels {
            function.add_basic_block(*label);
        }

        let mut any_profiled = false;
        let mut entry_exec = None;
        for (idx, spec) in self.blocks.into_iter().enumerate() {
            let id = BlockId::new(idx);

            for pre in spec.insts {
                let inst = match pre {
                    PreInst::Real(inst) => inst,
                    PreInst::Jump(target) => {
                        Instruction::with_target(Operation::Branch { cond: None }, labels[target])
                    }
                    PreInst::Cond(cond, target) => Instruction::with_target(
                        Operation::Branch { cond: Some(cond) },
                        labels[target],
                    ),
                    PreInst::TailCall(callee) => {
                        let sym = symbols.intern(&callee, None);
                        let mut inst =
                            Instruction::with_target(Operation::Branch { cond: None }, sym);
                        inst.annotations.set(AnnotationKind::TailCall, 1);
                        inst
                    }
                    PreInst::IndirectTailCall => {
                        let mut inst = Instruction::new(Operation::IndirectBranch);
                        inst.annotations.set(AnnotationKind::TailCall, 1);
                        inst
                    }
                    PreInst::Call(callee) => {
                        let sym = symbols.intern(&callee, None);
                        Instruction::with_target(Operation::Call, sym)
                    }
                    PreInst::LoadAbs(dst, address, width) => Instruction {
                        mem: Some(MemOperand {
                            base: None,
                            disp: address as i64,
                            pc_relative: false,
                            symbol: None,
                            width,
                        }),
                        ..Instruction::new(Operation::Load { dst })
                    },
                    PreInst::LoadSym(dst, symbol, disp, width) => {
                        let sym = symbols.intern(&symbol, None);
                        Instruction {
                            mem: Some(MemOperand {
                                base: None,
                                disp,
                                pc_relative: true,
                                symbol: Some(sym),
                                width,
                            }),
                            ..Instruction::new(Operation::Load { dst })
                        }
                    }
                    PreInst::JumpTable => Instruction::new(Operation::IndirectBranch),
                    PreInst::Ret => Instruction::new(Operation::Return { rep_prefix: false }),
                };
                function.block_mut(id).add_instruction(inst);
            }

            {
                let bb = function.block_mut(id);
                bb.is_entry = idx == 0 || spec.entry;
                bb.is_landing_pad = spec.landing_pad;
                bb.cfi_state = spec.cfi;
                bb.input_offset = idx as u64 * 0x10;
                if let Some(exec) = spec.exec {
                    bb.exec_count = ExecCount::new(exec);
                    any_profiled = true;
                    if idx == 0 {
                        entry_exec = Some(exec);
                    }
                }
                bb.has_jump_table = bb
                    .instructions
                    .iter()
                    .any(|i| matches!(i.op, Operation::IndirectBranch))
                    && !bb
                        .instructions
                        .iter()
                        .any(|i| i.annotations.contains(AnnotationKind::TailCall));
            }

            for (target, info) in spec.edges {
                function.add_edge(id, BlockId::new(target), info);
            }
        }

        if any_profiled {
            function.set_execution_count(ExecCount::new(entry_exec.unwrap_or(0)));
            function.set_valid_profile(true);
        }
        function
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_produces_consistent_cfg() {
        let f = FunctionBuilder::new("builder", 0x1000)
            .block(|b| b.exec(10).cond(CondCode::Eq, 1, 2).counts(4, 6))
            .block(|b| b.exec(4).jump(3))
            .block(|b| b.exec(6).jump(3))
            .block(|b| b.exec(10).ret())
            .build();

        assert!(f.validate_cfg());
        assert_eq!(f.block_count(), 4);
        assert!(f.has_valid_profile());
        assert_eq!(f.known_execution_count(), 10);
        assert!(f.block(BlockId::new(0)).is_entry_point());
        assert_eq!(
            f.block(BlockId::new(0)).taken_branch_info().count,
            ExecCount::new(4)
        );
    }

    #[test]
    fn test_builder_into_context_interns_symbols() {
        let ctx = test_context();
        let id = FunctionBuilder::new("ctxfn", 0x4000)
            .block(|b| b.push_call("callee").ret())
            .build_into(&ctx);

        assert!(ctx.symbols.lookup("ctxfn.bb0").is_some());
        assert!(ctx.symbols.lookup("callee").is_some());
        assert_eq!(
            ctx.with_function(id, |f| f.name().to_string()).unwrap(),
            "ctxfn"
        );
    }
}
