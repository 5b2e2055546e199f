//! Parallel scheduling harness for per-function pass work.
//!
//! Each pass distributes its per-function work across the rayon worker pool. Because
//! per-function cost varies wildly - a pass may be linear in block count, linear in
//! instruction count, or constant - naive chunking leaves workers idle behind one giant
//! function. The harness therefore buckets functions by an explicit cost estimate before
//! handing the buckets to the pool.
//!
//! Guarantees:
//!
//! - every non-skipped function is visited exactly once per invocation,
//! - the skip predicate is evaluated once per function and must be side-effect-free,
//! - the call does not return until all per-function work has completed (the barrier
//!   between passes),
//! - no ordering is guaranteed between functions.

use rayon::prelude::*;

use crate::{
    binary::{BinaryContext, FunctionId},
    cfg::BinaryFunction,
};

/// How per-function cost scales for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Cost is independent of function size.
    Constant,
    /// Cost is proportional to the basic block count.
    BlockLinear,
    /// Cost is proportional to the instruction count.
    InstLinear,
}

/// Number of buckets per worker thread; more buckets smooth out estimation error.
const BUCKETS_PER_THREAD: usize = 4;

/// Runs `work` on every function not rejected by `skip`, in parallel.
///
/// Functions are checked out of the registry one at a time, so `work` holds exclusive
/// ownership of its function and may freely use the context's shared services.
///
/// # Arguments
///
/// * `ctx` - The binary context
/// * `policy` - Cost model used to balance work across threads
/// * `work` - Per-function work; must be thread-safe
/// * `skip` - Side-effect-free predicate selecting functions to skip
/// * `_name` - Pass name, for diagnostics
pub fn run_on_each_function<W, S>(
    ctx: &BinaryContext,
    policy: SchedulingPolicy,
    work: W,
    skip: S,
    _name: &str,
) where
    W: Fn(&mut BinaryFunction, &BinaryContext) + Sync,
    S: Fn(&BinaryFunction) -> bool + Sync,
{
    let mut items: Vec<(FunctionId, u64)> = Vec::new();
    for id in ctx.function_ids() {
        let cost = ctx.with_function(id, |f| {
            if skip(f) {
                None
            } else {
                Some(estimate_cost(f, policy))
            }
        });
        if let Some(Some(cost)) = cost {
            items.push((id, cost));
        }
    }

    if items.is_empty() {
        return;
    }

    let buckets = balance(items, rayon::current_num_threads() * BUCKETS_PER_THREAD);
    buckets.par_iter().for_each(|bucket| {
        for &id in bucket {
            ctx.with_function_mut(id, |f| work(f, ctx));
        }
    });
}

fn estimate_cost(function: &BinaryFunction, policy: SchedulingPolicy) -> u64 {
    match policy {
        SchedulingPolicy::Constant => 1,
        SchedulingPolicy::BlockLinear => function.block_count() as u64 + 1,
        SchedulingPolicy::InstLinear => function.instruction_count() as u64 + 1,
    }
}

/// Longest-processing-time greedy bucketing: heaviest items first, each into the currently
/// lightest bucket.
fn balance(mut items: Vec<(FunctionId, u64)>, bucket_count: usize) -> Vec<Vec<FunctionId>> {
    let bucket_count = bucket_count.max(1).min(items.len());
    items.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut buckets: Vec<Vec<FunctionId>> = vec![Vec::new(); bucket_count];
    let mut loads: Vec<u64> = vec![0; bucket_count];

    for (id, cost) in items {
        let lightest = loads
            .iter()
            .enumerate()
            .min_by_key(|&(_, &load)| load)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        buckets[lightest].push(id);
        loads[lightest] += cost;
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::test::{test_context, FunctionBuilder};

    #[test]
    fn test_every_function_visited_exactly_once() {
        let ctx = test_context();
        for i in 0..32u64 {
            FunctionBuilder::new(format!("f{i}"), 0x1000 + i * 0x100)
                .block(|b| b.ret())
                .build_into(&ctx);
        }

        let visits = AtomicUsize::new(0);
        run_on_each_function(
            &ctx,
            SchedulingPolicy::BlockLinear,
            |_, _| {
                visits.fetch_add(1, Ordering::Relaxed);
            },
            |_| false,
            "test",
        );
        assert_eq!(visits.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn test_skip_predicate_filters() {
        let ctx = test_context();
        let keep = FunctionBuilder::new("keep", 0x1000)
            .block(|b| b.ret())
            .build_into(&ctx);
        let drop = FunctionBuilder::new("drop", 0x2000)
            .block(|b| b.ret())
            .build_into(&ctx);
        ctx.with_function_mut(drop, |f| f.set_ignored(true));

        let visits = AtomicUsize::new(0);
        run_on_each_function(
            &ctx,
            SchedulingPolicy::Constant,
            |f, _| {
                assert_eq!(f.name(), "keep");
                visits.fetch_add(1, Ordering::Relaxed);
            },
            |f| f.is_ignored(),
            "test",
        );
        assert_eq!(visits.load(Ordering::Relaxed), 1);
        let _ = keep;
    }

    #[test]
    fn test_balance_spreads_load() {
        let items: Vec<(FunctionId, u64)> =
            (0..10u64).map(|i| (FunctionId(i), i + 1)).collect();
        let buckets = balance(items, 3);
        assert_eq!(buckets.len(), 3);
        let total: usize = buckets.iter().map(Vec::len).sum();
        assert_eq!(total, 10);
    }
}
