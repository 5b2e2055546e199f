//! Branch fixup after layout changes.

use crate::{binary::BinaryContext, passes::BinaryPass, Result};

/// Repairs branch instructions of every emittable function against its final layout.
///
/// Must run after any pass that reorders blocks or rewrites edges and before finalization,
/// so emitted branches match the successor lists and fall-throughs of the final layout.
#[derive(Debug, Default)]
pub struct FixupBranches;

impl FixupBranches {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        FixupBranches
    }
}

impl BinaryPass for FixupBranches {
    fn name(&self) -> &'static str {
        "fixup-branches"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        for id in ctx.function_ids() {
            ctx.with_function_mut(id, |function| {
                if ctx.should_emit(function) && function.is_simple() {
                    function.fix_branches(ctx.isa.as_ref());
                }
            });
        }
        Ok(())
    }
}
