//! Statically-resolvable load simplification.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;

use crate::{
    binary::{BinaryContext, FunctionId},
    cfg::{BinaryFunction, BlockId},
    passes::BinaryPass,
    Result,
};

/// Replaces loads from read-only, non-relocated data with the loaded immediate.
///
/// A load qualifies when its effective address can be computed statically - either an
/// absolute memory operand or a PC-relative reference to a known symbol - and the address
/// falls into a read-only section with no static or dynamic relocation patching it. The
/// immediate is read directly from the section's byte contents.
#[derive(Debug, Default)]
pub struct SimplifyRoDataLoads {
    num_loads_simplified: AtomicU64,
    num_dynamic_loads_simplified: AtomicU64,
    num_loads_found: AtomicU64,
    num_dynamic_loads_found: AtomicU64,
    modified: DashSet<FunctionId>,
}

impl SimplifyRoDataLoads {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        SimplifyRoDataLoads::default()
    }

    /// Loads simplified across the run.
    #[must_use]
    pub fn simplified(&self) -> u64 {
        self.num_loads_simplified.load(Ordering::Relaxed)
    }

    fn simplify_loads(&self, function: &mut BinaryFunction, ctx: &BinaryContext) -> bool {
        let isa = ctx.isa.as_ref();
        let mut simplified = 0u64;

        let ids: Vec<BlockId> = function.layout().blocks().to_vec();
        for id in ids {
            let len = function.block(id).instructions().len();
            for idx in 0..len {
                let inst = &function.block(id).instructions()[idx];
                if !isa.may_load(inst) {
                    continue;
                }

                // Statically evaluate the target memory address.
                let target_address = if isa.has_pc_rel_operand(inst) {
                    let Some((symbol, displacement)) = isa.mem_operand_symbol(inst) else {
                        continue;
                    };
                    let Some(base) = ctx.symbol_address(symbol) else {
                        continue;
                    };
                    base.wrapping_add_signed(displacement)
                } else if let Some(address) = isa.evaluate_mem_operand_target(inst) {
                    address
                } else {
                    continue;
                };

                // Only read-only sections with no relocation at the target qualify.
                let Some(section) = ctx.sections.section_for_address(target_address) else {
                    continue;
                };
                if section.writable
                    || ctx.sections.has_relocation_at(target_address)
                    || ctx.sections.has_dynamic_relocation_at(target_address)
                {
                    continue;
                }

                let offset = (target_address - section.address) as usize;
                let exec = function.block(id).known_execution_count();
                let has_profile = function.block(id).has_profile();

                self.num_loads_found.fetch_add(1, Ordering::Relaxed);
                if has_profile {
                    self.num_dynamic_loads_found.fetch_add(exec, Ordering::Relaxed);
                }

                if isa.replace_mem_operand_with_imm(
                    &mut function.block_mut(id).instructions_mut()[idx],
                    &section.contents,
                    offset,
                ) {
                    simplified += 1;
                    if has_profile {
                        self.num_dynamic_loads_simplified
                            .fetch_add(exec, Ordering::Relaxed);
                    }
                }
            }
        }

        self.num_loads_simplified.fetch_add(simplified, Ordering::Relaxed);
        simplified > 0
    }
}

impl BinaryPass for SimplifyRoDataLoads {
    fn name(&self) -> &'static str {
        "simplify-rodata-loads"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        for id in ctx.function_ids() {
            ctx.with_function_mut(id, |function| {
                if self.should_optimize(function) && self.simplify_loads(function, ctx) {
                    self.modified.insert(id);
                }
            });
        }

        ctx.sink.info(format_args!(
            "simplified {} out of {} loads from a statically computed address.",
            self.num_loads_simplified.load(Ordering::Relaxed),
            self.num_loads_found.load(Ordering::Relaxed)
        ));
        ctx.sink.info(format_args!(
            "dynamic loads simplified: {}",
            self.num_dynamic_loads_simplified.load(Ordering::Relaxed)
        ));
        ctx.sink.info(format_args!(
            "dynamic loads found: {}",
            self.num_dynamic_loads_found.load(Ordering::Relaxed)
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binary::BinarySection,
        cfg::Operation,
        test::{test_context, FunctionBuilder},
    };

    fn rodata_ctx() -> BinaryContext {
        let mut ctx = test_context();
        let mut contents = vec![0u8; 0x20];
        contents[0x10..0x14].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        ctx.add_section(BinarySection::new(".rodata", 0x2000, false, contents));
        ctx.add_section(BinarySection::new(".data", 0x3000, true, vec![0xff; 0x10]));
        ctx
    }

    #[test]
    fn test_absolute_load_from_rodata_simplified() {
        let ctx = rodata_ctx();
        let id = FunctionBuilder::new("ro", 0x1000)
            .block(|b| b.exec(10).push_load_abs(3, 0x2010, 4).ret())
            .build_into(&ctx);

        let pass = SimplifyRoDataLoads::new();
        pass.run(&ctx).unwrap();

        assert_eq!(pass.simplified(), 1);
        assert_eq!(pass.num_dynamic_loads_simplified.load(Ordering::Relaxed), 10);
        ctx.with_function(id, |f| {
            let inst = &f.block(BlockId::new(0)).instructions()[0];
            assert_eq!(inst.op, Operation::MoveImm { dst: 3, wide: false });
            assert_eq!(inst.imm, Some(0x1234_5678));
        });
    }

    #[test]
    fn test_pc_relative_load_through_symbol() {
        let ctx = rodata_ctx();
        ctx.intern_symbol("const_table", Some(0x2008));
        let id = FunctionBuilder::new("pcrel", 0x1000)
            .block(|b| b.push_load_sym(2, "const_table", 8, 4).ret())
            .build_into(&ctx);

        let pass = SimplifyRoDataLoads::new();
        pass.run(&ctx).unwrap();

        assert_eq!(pass.simplified(), 1);
        ctx.with_function(id, |f| {
            let inst = &f.block(BlockId::new(0)).instructions()[0];
            assert_eq!(inst.imm, Some(0x1234_5678));
        });
    }

    #[test]
    fn test_writable_section_is_skipped() {
        let ctx = rodata_ctx();
        FunctionBuilder::new("rw", 0x1000)
            .block(|b| b.push_load_abs(3, 0x3004, 4).ret())
            .build_into(&ctx);

        let pass = SimplifyRoDataLoads::new();
        pass.run(&ctx).unwrap();
        assert_eq!(pass.simplified(), 0);
        assert_eq!(pass.num_loads_found.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_relocated_address_is_skipped() {
        let mut ctx = rodata_ctx();
        ctx.sections.add_relocation(0x2010);
        FunctionBuilder::new("reloc", 0x1000)
            .block(|b| b.push_load_abs(3, 0x2010, 4).ret())
            .build_into(&ctx);

        let pass = SimplifyRoDataLoads::new();
        pass.run(&ctx).unwrap();
        assert_eq!(pass.simplified(), 0);
    }
}
