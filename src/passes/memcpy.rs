//! Memcpy inlining and single-byte specialization.
//!
//! Both passes must run before anything that inserts or reorders calls: the specialization
//! spec addresses call sites by their 1-based enumeration order within the function, and the
//! indices are re-derived freshly on every run.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    binary::{BinaryContext, FunctionId},
    cfg::{BinaryFunction, BlockId, BranchInfo, ExecCount},
    passes::BinaryPass,
    Result,
};

/// Well-known copy-routine symbols eligible for inlining.
const MEMCPY_NAMES: [&str; 3] = ["memcpy", "memcpy@PLT", "_memcpy8"];

/// Replaces direct calls to well-known copy routines with an inline instruction sequence.
///
/// `_memcpy8` callers get the fixed 8-byte variant. Tail-call sites are followed by an
/// explicit return, since the call no longer transfers control away.
#[derive(Debug, Default)]
pub struct InlineMemcpy {
    num_inlined: AtomicU64,
    num_inlined_dyno: AtomicU64,
}

impl InlineMemcpy {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        InlineMemcpy::default()
    }

    /// Call sites inlined across the run.
    #[must_use]
    pub fn inlined(&self) -> u64 {
        self.num_inlined.load(Ordering::Relaxed)
    }

    fn run_on_function(&self, function: &mut BinaryFunction, ctx: &BinaryContext) {
        let isa = ctx.isa.as_ref();
        let ids: Vec<BlockId> = function.block_ids().collect();
        for id in ids {
            let mut idx = 0;
            while idx < function.block(id).instructions().len() {
                let inst = &function.block(id).instructions()[idx];
                if !isa.is_call(inst) || isa.is_indirect_call(inst) {
                    idx += 1;
                    continue;
                }
                let Some(callee) = isa.target_symbol(inst) else {
                    idx += 1;
                    continue;
                };
                let callee_name = ctx.symbols.name(callee).to_string();
                if !MEMCPY_NAMES.contains(&callee_name.as_str()) {
                    idx += 1;
                    continue;
                }

                let is_memcpy8 = callee_name == "_memcpy8";
                let is_tail_call = isa.is_tail_call(inst);

                let new_code = isa.create_inline_memcpy(is_memcpy8);
                let mut last = function.block_mut(id).replace_instruction(idx, new_code);
                if is_tail_call {
                    let ret = isa.create_return();
                    last += 1;
                    function.block_mut(id).instructions_mut().insert(last, ret);
                }
                idx = last + 1;

                self.num_inlined.fetch_add(1, Ordering::Relaxed);
                self.num_inlined_dyno
                    .fetch_add(function.block(id).known_execution_count(), Ordering::Relaxed);
            }
        }
    }
}

impl BinaryPass for InlineMemcpy {
    fn name(&self) -> &'static str {
        "inline-memcpy"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        if !ctx.isa.supports_inline_memcpy() {
            return Ok(());
        }

        for id in ctx.function_ids() {
            ctx.with_function_mut(id, |function| self.run_on_function(function, ctx));
        }

        let inlined = self.num_inlined.load(Ordering::Relaxed);
        if inlined > 0 {
            let dyno = self.num_inlined_dyno.load(Ordering::Relaxed);
            if dyno > 0 {
                ctx.sink.info(format_args!(
                    "inlined {inlined} memcpy() calls. The calls were executed {dyno} times based on profile."
                ));
            } else {
                ctx.sink
                    .info(format_args!("inlined {inlined} memcpy() calls"));
            }
        }
        Ok(())
    }
}

/// Splits selected memcpy call sites into a runtime size check that branches to a
/// specialized single-byte copy path versus the general call.
///
/// Call sites are selected by spec strings of the form `function:site:site…`, with 1-based
/// site indices in per-function enumeration order; an empty site list selects every site in
/// the named function. Rewritten sites preserve the post-call control flow and the CFI state
/// of the successor block.
#[derive(Debug, Default)]
pub struct SpecializeMemcpy {
    num_specialized: AtomicU64,
    num_specialized_dyno: AtomicU64,
}

impl SpecializeMemcpy {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        SpecializeMemcpy::default()
    }

    /// Call sites specialized across the run.
    #[must_use]
    pub fn specialized(&self) -> u64 {
        self.num_specialized.load(Ordering::Relaxed)
    }

    fn spec_matches(&self, ctx: &BinaryContext, function: &BinaryFunction) -> bool {
        ctx.opts
            .memcpy_spec
            .iter()
            .any(|spec| spec.split(':').next() == Some(function.name()))
    }

    /// Parses the 1-based call-site indices configured for `function`.
    fn call_sites_to_optimize(&self, ctx: &BinaryContext, function: &BinaryFunction) -> Vec<usize> {
        let mut sites = Vec::new();
        for spec in &ctx.opts.memcpy_spec {
            let mut parts = spec.split(':');
            if parts.next() != Some(function.name()) {
                continue;
            }
            for part in parts {
                if let Ok(site) = part.parse::<usize>() {
                    sites.push(site);
                }
            }
        }
        sites.sort_unstable();
        sites.dedup();
        sites
    }

    #[allow(clippy::too_many_lines)]
    fn run_on_function(&self, function: &mut BinaryFunction, ctx: &BinaryContext) {
        let isa = ctx.isa.as_ref();
        let sites = self.call_sites_to_optimize(ctx, function);
        let should_optimize_site = |site: usize| sites.is_empty() || sites.contains(&site);

        let blocks: Vec<BlockId> = function.layout().blocks().to_vec();
        let mut call_site_id = 0usize;

        for start_block in blocks {
            let mut current = start_block;
            let mut idx = 0usize;

            loop {
                if idx >= function.block(current).instructions().len() {
                    break;
                }
                let inst = &function.block(current).instructions()[idx];
                if !isa.is_call(inst) || isa.is_indirect_call(inst) || isa.is_tail_call(inst) {
                    idx += 1;
                    continue;
                }
                let Some(callee) = isa.target_symbol(inst) else {
                    idx += 1;
                    continue;
                };
                let callee_name = ctx.symbols.name(callee);
                if callee_name != "memcpy" && callee_name != "memcpy@PLT" {
                    idx += 1;
                    continue;
                }

                call_site_id += 1;
                if !should_optimize_site(call_site_id) {
                    idx += 1;
                    continue;
                }

                // Keep a copy of the general call for the out-of-line path.
                let memcpy_call = function.block(current).instructions()[idx].clone();
                let exec = function.block(current).known_execution_count();

                // Split off the call and everything after it.
                let one_byte_label = ctx.intern_symbol(
                    &format!("{}.memcpy1.{call_site_id}", function.name()),
                    None,
                );
                let one_byte_bb = function.split_block_at(current, idx, one_byte_label);

                // Carve the post-call continuation out of the split-off block.
                let next_bb = if function.block(one_byte_bb).num_non_pseudos() > 1 {
                    let next_label = ctx.intern_symbol(
                        &format!("{}.memcpy1cont.{call_site_id}", function.name()),
                        None,
                    );
                    let next = function.split_block_at(one_byte_bb, 1, next_label);
                    function.block_mut(one_byte_bb).erase_instruction(0);
                    next
                } else {
                    let next = function
                        .block(one_byte_bb)
                        .successor()
                        .expect("call to memcpy() with no return");
                    function.block_mut(one_byte_bb).erase_instruction(0);
                    next
                };

                // Out-of-line block holding the general call.
                let memcpy_label = ctx.intern_symbol(
                    &format!("{}.memcpygen.{call_site_id}", function.name()),
                    None,
                );
                let memcpy_bb = function.add_basic_block(memcpy_label);
                let offset = function.block(current).input_offset();
                function.block_mut(memcpy_bb).set_input_offset(offset);

                // Size check: a one-byte copy branches to the specialized path, anything
                // else falls through to the general call.
                let cmp_jcc = isa.create_cmp_je(isa.int_arg_register(2), 1, one_byte_label);
                for inst in cmp_jcc {
                    function.block_mut(current).add_instruction(inst);
                }
                function.add_edge(
                    current,
                    memcpy_bb,
                    BranchInfo {
                        count: ExecCount::ZERO,
                        mispredicted: ExecCount::ZERO,
                    },
                );

                function.block_mut(memcpy_bb).add_instruction(memcpy_call);
                function.add_edge(
                    memcpy_bb,
                    next_bb,
                    BranchInfo {
                        count: ExecCount::ZERO,
                        mispredicted: ExecCount::ZERO,
                    },
                );
                let next_cfi = function.block(next_bb).cfi_state();
                function.block_mut(memcpy_bb).set_cfi_state(next_cfi);

                // Pin the general call hot enough that it is never moved to cold code.
                let pinned = if exec > 0 {
                    ExecCount::new(1)
                } else {
                    ExecCount::ZERO
                };
                function.block_mut(memcpy_bb).set_execution_count(pinned);

                for inst in isa.create_one_byte_memcpy() {
                    function.block_mut(one_byte_bb).add_instruction(inst);
                }

                self.num_specialized.fetch_add(1, Ordering::Relaxed);
                self.num_specialized_dyno.fetch_add(exec, Ordering::Relaxed);

                // Continue scanning in the post-call block; the next instruction is not
                // expected to be another memcpy call.
                current = next_bb;
                idx = 0;
            }
        }
    }
}

impl BinaryPass for SpecializeMemcpy {
    fn name(&self) -> &'static str {
        "specialize-memcpy"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        if !ctx.isa.supports_inline_memcpy() || ctx.opts.memcpy_spec.is_empty() {
            return Ok(());
        }

        for id in ctx.function_ids() {
            ctx.with_function_mut(id, |function| {
                if self.should_optimize(function) && self.spec_matches(ctx, function) {
                    self.run_on_function(function, ctx);
                }
            });
        }

        let specialized = self.num_specialized.load(Ordering::Relaxed);
        if specialized > 0 {
            let dyno = self.num_specialized_dyno.load(Ordering::Relaxed);
            if dyno > 0 {
                ctx.sink.info(format_args!(
                    "specialized {specialized} memcpy() call sites for size 1. The calls were executed {dyno} times based on profile."
                ));
            } else {
                ctx.sink.info(format_args!(
                    "specialized {specialized} memcpy() call sites for size 1"
                ));
            }
        }
        Ok(())
    }
}
