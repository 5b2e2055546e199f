//! Emitter-state cleanup after speculative size estimation.

use crate::{binary::BinaryContext, passes::BinaryPass, Result};

/// Resets symbol state dirtied by parallel speculative emission.
///
/// Size estimation runs concurrently on worker threads and marks symbols defined or
/// registered as a real emission would. Left in place, that state would make the actual
/// rewrite see symbols as double-defined. This pass scrubs every affected symbol; it must
/// run after any pass that estimated sizes in parallel and before emission.
#[derive(Debug, Default)]
pub struct CleanEmitterState;

impl CleanEmitterState {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        CleanEmitterState
    }
}

impl BinaryPass for CleanEmitterState {
    fn name(&self) -> &'static str {
        "clean-emitter-state"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        for symbol in ctx.symbols.iter() {
            if symbol.is_defined() {
                if ctx.opts.verbosity > 1 {
                    ctx.sink.info(format_args!(
                        "symbol \"{}\" is already defined",
                        symbol.name
                    ));
                }
                symbol.set_defined(false);
            }
            if symbol.is_registered() {
                if ctx.opts.verbosity > 1 {
                    ctx.sink.info(format_args!(
                        "symbol \"{}\" is already registered",
                        symbol.name
                    ));
                }
                symbol.set_registered(false);
            }
        }
        Ok(())
    }
}
