//! Legacy `rep ret` stripping.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    binary::BinaryContext,
    cfg::BlockId,
    passes::BinaryPass,
    Result,
};

/// Deletes the legacy `rep` prefix from terminal returns.
///
/// The prefix was a workaround for ancient branch predictors and only wastes a byte on
/// anything current.
#[derive(Debug, Default)]
pub struct StripRepRet {
    num_prefixes_removed: AtomicU64,
    num_bytes_saved: AtomicU64,
}

impl StripRepRet {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        StripRepRet::default()
    }

    /// Bytes saved across the run (one per stripped prefix).
    #[must_use]
    pub fn bytes_saved(&self) -> u64 {
        self.num_bytes_saved.load(Ordering::Relaxed)
    }
}

impl BinaryPass for StripRepRet {
    fn name(&self) -> &'static str {
        "strip-rep-ret"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        if !ctx.isa.supports_rep_prefix() {
            return Ok(());
        }

        for id in ctx.function_ids() {
            ctx.with_function_mut(id, |function| {
                let ids: Vec<BlockId> = function.block_ids().collect();
                for block in ids {
                    let Some(last_idx) = function.block(block).last_non_pseudo_index() else {
                        continue;
                    };
                    let inst = &function.block(block).instructions()[last_idx];
                    if !ctx.isa.is_return(inst) {
                        continue;
                    }
                    if ctx
                        .isa
                        .remove_rep_prefix(&mut function.block_mut(block).instructions_mut()[last_idx])
                    {
                        self.num_prefixes_removed.fetch_add(
                            function.block(block).known_execution_count(),
                            Ordering::Relaxed,
                        );
                        self.num_bytes_saved.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }

        let bytes = self.num_bytes_saved.load(Ordering::Relaxed);
        if bytes > 0 {
            ctx.sink.info(format_args!(
                "removed {bytes} 'repz' prefixes with estimated execution count of {} times.",
                self.num_prefixes_removed.load(Ordering::Relaxed)
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cfg::{Instruction, Operation},
        test::{test_context, FunctionBuilder},
    };

    #[test]
    fn test_rep_ret_is_stripped() {
        let ctx = test_context();
        let rep_ret = Instruction::new(Operation::Return { rep_prefix: true });
        let id = FunctionBuilder::new("repret", 0x1000)
            .block(move |b| b.exec(40).push(rep_ret))
            .build_into(&ctx);

        let pass = StripRepRet::new();
        pass.run(&ctx).unwrap();

        assert_eq!(pass.bytes_saved(), 1);
        assert_eq!(pass.num_prefixes_removed.load(Ordering::Relaxed), 40);
        ctx.with_function(id, |f| {
            assert_eq!(
                f.block(BlockId::new(0)).instructions()[0].op,
                Operation::Return { rep_prefix: false }
            );
        });
    }

    #[test]
    fn test_plain_ret_untouched() {
        let ctx = test_context();
        FunctionBuilder::new("plain", 0x1000)
            .block(|b| b.ret())
            .build_into(&ctx);

        let pass = StripRepRet::new();
        pass.run(&ctx).unwrap();
        assert_eq!(pass.bytes_saved(), 0);
    }
}
