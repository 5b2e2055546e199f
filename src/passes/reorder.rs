//! Profile-guided basic block reordering.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use crate::{
    binary::{BinaryContext, FunctionId},
    cfg::{BinaryFunction, BlockId},
    config::LayoutMode,
    passes::{
        algo::{ClusterVariant, GreedyObjective, ReorderStrategy},
        run_on_each_function, BinaryPass, SchedulingPolicy,
    },
    Result,
};

/// Chooses a new linear order of basic blocks per function.
///
/// The strategy is selected by the configured [`LayoutMode`]: small functions get the exact
/// solver, larger ones a clustering heuristic. All modes except `Reverse` and
/// `ClusterShuffle` require a validated profile; functions with zero blocks or layout mode
/// `None` are left untouched.
#[derive(Debug, Default)]
pub struct ReorderBasicBlocks {
    modified_func_count: AtomicU64,
    edit_distance: Mutex<HashMap<FunctionId, u64>>,
}

impl ReorderBasicBlocks {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        ReorderBasicBlocks::default()
    }

    /// Number of functions whose layout changed.
    #[must_use]
    pub fn modified_count(&self) -> u64 {
        self.modified_func_count.load(Ordering::Relaxed)
    }

    /// Recomputes the layout of one function.
    ///
    /// # Returns
    ///
    /// `true` if the layout changed.
    pub fn modify_function_layout(
        &self,
        function: &mut BinaryFunction,
        mode: LayoutMode,
        min_branch_clusters: bool,
        tsp_threshold: usize,
        shuffle_seed: u64,
        ctx: &BinaryContext,
    ) -> bool {
        if function.block_count() == 0 || mode == LayoutMode::None {
            return false;
        }

        // Cannot do optimal layout without profile.
        if mode != LayoutMode::Reverse
            && mode != LayoutMode::ClusterShuffle
            && !function.has_valid_profile()
        {
            return false;
        }

        let variant = if min_branch_clusters {
            ClusterVariant::MinBranch
        } else {
            ClusterVariant::ProfileGreedy
        };

        let strategy = if mode == LayoutMode::Reverse {
            ReorderStrategy::Reverse
        } else if function.block_count() <= tsp_threshold && mode != LayoutMode::ClusterShuffle {
            // Work on the optimal solution if the problem is small enough.
            ReorderStrategy::ExactTsp
        } else {
            match mode {
                LayoutMode::Optimize => ReorderStrategy::Greedy {
                    variant,
                    objective: GreedyObjective::TakenBranches,
                },
                LayoutMode::OptimizeBranch => ReorderStrategy::Greedy {
                    variant,
                    objective: GreedyObjective::Mispredictions,
                },
                LayoutMode::OptimizeCache | LayoutMode::ExtTsp => ReorderStrategy::ExtTsp,
                LayoutMode::ClusterShuffle => ReorderStrategy::Shuffle {
                    variant,
                    seed: shuffle_seed,
                },
                LayoutMode::None | LayoutMode::Reverse => unreachable!("handled above"),
            }
        };

        let estimator = ctx.create_independent_emitter();
        let new_order = strategy.compute_order(function, &estimator);
        function.layout_mut().update(new_order)
    }

    fn run_on_function(&self, function: &mut BinaryFunction, ctx: &BinaryContext, mode: LayoutMode) {
        let collect_stats = ctx.opts.print_function_statistics > 0;
        let old_order: Vec<BlockId> = if collect_stats {
            function.layout().blocks().to_vec()
        } else {
            Vec::new()
        };

        let changed = self.modify_function_layout(
            function,
            mode,
            ctx.opts.min_branch_clusters,
            ctx.opts.tsp_threshold,
            ctx.opts.shuffle_seed,
            ctx,
        );

        if changed {
            self.modified_func_count.fetch_add(1, Ordering::Relaxed);
            if collect_stats {
                let distance = function.layout().edit_distance(&old_order);
                // Several functions may finish at once; the map takes a dedicated lock.
                if let Ok(mut map) = self.edit_distance.lock() {
                    map.insert(FunctionId(function.address()), distance);
                }
            }
        }
    }
}

impl BinaryPass for ReorderBasicBlocks {
    fn name(&self) -> &'static str {
        "reorder-blocks"
    }

    fn should_optimize(&self, function: &BinaryFunction) -> bool {
        function.is_simple() && function.has_cfg() && !function.is_ignored()
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        let mode = ctx.opts.layout.canonicalize(&ctx.sink);
        if mode == LayoutMode::None {
            return Ok(());
        }
        let threshold = ctx.opts.exec_count_threshold;

        run_on_each_function(
            ctx,
            SchedulingPolicy::BlockLinear,
            |function, ctx| self.run_on_function(function, ctx, mode),
            |function| {
                !self.should_optimize(function)
                    || function.known_execution_count() < threshold
            },
            self.name(),
        );

        let modified = self.modified_func_count.load(Ordering::Relaxed);
        let all_profiled = ctx.all_profiled_functions().max(1);
        let total = ctx.function_count().max(1);
        ctx.sink.info(format_args!(
            "basic block reordering modified layout of {modified} functions ({:.2}% of profiled, {:.2}% of total)",
            100.0 * modified as f64 / all_profiled as f64,
            100.0 * modified as f64 / total as f64,
        ));

        if ctx.opts.print_function_statistics > 0 {
            self.print_function_statistics(ctx);
        }
        Ok(())
    }
}

impl ReorderBasicBlocks {
    fn print_function_statistics(&self, ctx: &BinaryContext) {
        let mut ranked: Vec<(u64, FunctionId)> = ctx
            .function_ids()
            .into_iter()
            .filter_map(|id| ctx.with_function(id, |f| (f.function_score(), id)))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let distances = match self.edit_distance.lock() {
            Ok(map) => map,
            Err(_) => return,
        };

        ctx.sink.raw(format_args!("\nPrinting Function Statistics:\n"));
        ctx.sink.raw(format_args!(
            "           There are {} functions in total.",
            ctx.function_count()
        ));
        ctx.sink.raw(format_args!(
            "           Number of functions being modified: {}",
            self.modified_func_count.load(Ordering::Relaxed)
        ));

        for (rank, (score, id)) in ranked
            .iter()
            .take(ctx.opts.print_function_statistics)
            .enumerate()
        {
            ctx.with_function(*id, |f| {
                ctx.sink.raw(format_args!(
                    "           Information for function of top: {}:",
                    rank + 1
                ));
                ctx.sink
                    .raw(format_args!("             Function Score is: {score}"));
                ctx.sink.raw(format_args!(
                    "             There are {} number of blocks in this function.",
                    f.block_count()
                ));
                ctx.sink.raw(format_args!(
                    "             There are {} number of instructions in this function.",
                    f.instruction_count()
                ));
                ctx.sink.raw(format_args!(
                    "             The edit distance for this function is: {}\n",
                    distances.get(id).copied().unwrap_or(0)
                ));
            });
        }
    }
}
