//! Binary optimization passes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Pass Pipeline                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  PassManager                 Strict in-order execution           │
//! │    └─ run(ctx)               Pass N+1 starts only after N        │
//! │                                                                  │
//! │  BinaryPass trait            Interface for all passes            │
//! │    ├─ run(ctx)               Whole-program entry point           │
//! │    └─ should_optimize()      Per-function eligibility            │
//! │                                                                  │
//! │  scheduler                   Parallel per-function dispatch      │
//! │    └─ run_on_each_function   Cost-balanced rayon buckets         │
//! │                                                                  │
//! │  Passes                      CFG cleanup, layout, rewriting      │
//! │    ├─ Structure: NormalizeCfg, EliminateUnreachableBlocks        │
//! │    ├─ Layout:    ReorderBasicBlocks, FixupBranches               │
//! │    ├─ Rewrites:  SimplifyConditionalTailCalls, Peepholes,        │
//! │    │             ShortenInstructions, SimplifyRoDataLoads,       │
//! │    │             RemoveNops, InlineMemcpy, SpecializeMemcpy,     │
//! │    │             StripRepRet                                     │
//! │    └─ Finish:    CleanEmitterState, FinalizeFunctions,           │
//! │                  CheckLargeFunctions, PrintProgramStats,         │
//! │                  PrintProfileStats                               │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Within a pass, per-function mutations are independent and run in parallel; global
//! counters are aggregated under atomics or a single lock and reported once per pass.

mod algo;
mod cleanup;
mod finalize;
mod fixup;
mod manager;
mod memcpy;
mod nops;
mod normalize;
mod peephole;
mod reorder;
mod represt;
mod roloads;
mod scheduler;
mod sctc;
mod shorten;
mod stats;
mod unreachable;

pub use algo::{ClusterVariant, GreedyObjective, ReorderStrategy};
pub use cleanup::CleanEmitterState;
pub use finalize::{CheckLargeFunctions, FinalizeFunctions};
pub use fixup::FixupBranches;
pub use manager::PassManager;
pub use memcpy::{InlineMemcpy, SpecializeMemcpy};
pub use nops::RemoveNops;
pub use normalize::NormalizeCfg;
pub use peephole::Peepholes;
pub use reorder::ReorderBasicBlocks;
pub use represt::StripRepRet;
pub use roloads::SimplifyRoDataLoads;
pub use scheduler::{run_on_each_function, SchedulingPolicy};
pub use sctc::SimplifyConditionalTailCalls;
pub use shorten::ShortenInstructions;
pub use stats::{PrintProfileStats, PrintProgramStats};
pub use unreachable::EliminateUnreachableBlocks;

use crate::{binary::BinaryContext, cfg::BinaryFunction, Result};

/// A whole-program optimization pass.
///
/// All passes must be thread-safe: per-function work is dispatched across worker threads by
/// the [`scheduler`](run_on_each_function), and global counters live in atomics or behind a
/// single lock inside the pass.
pub trait BinaryPass: Send + Sync {
    /// Unique name for diagnostics.
    fn name(&self) -> &'static str;

    /// Per-function eligibility check.
    ///
    /// The default accepts simple functions with a reconstructed CFG that were not excluded
    /// from optimization. Must be side-effect-free and thread-safe; it may be called from any
    /// worker.
    fn should_optimize(&self, function: &BinaryFunction) -> bool {
        function.is_simple() && function.has_cfg() && !function.is_ignored()
    }

    /// Runs the pass over the whole function set.
    ///
    /// Per-function anomalies are recovered by skipping the site; an `Err` aborts the
    /// pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error for fatal, pipeline-aborting conditions only.
    fn run(&self, ctx: &BinaryContext) -> Result<()>;
}
