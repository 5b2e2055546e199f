//! Program- and profile-level statistics reporting.

use std::sync::atomic::Ordering;

use crate::{
    binary::{BinaryContext, FunctionId},
    dynostats::DynoStats,
    passes::BinaryPass,
    Error, Result,
};

/// Aggregates and prints program-wide profile statistics.
///
/// Counts profiled, stale and inferred functions and their samples, reports them once, and
/// enforces the stale-profile tolerance: when the percentage of stale functions among all
/// profiled functions exceeds the configured threshold the pipeline aborts; below it the
/// condition is a warning only.
#[derive(Debug, Default)]
pub struct PrintProgramStats;

impl PrintProgramStats {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        PrintProgramStats
    }
}

impl BinaryPass for PrintProgramStats {
    fn name(&self) -> &'static str {
        "print-program-stats"
    }

    #[allow(clippy::too_many_lines)]
    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        let mut num_regular_functions = 0u64;
        let mut num_stale_profile_functions = 0u64;
        let mut num_inferred_functions = 0u64;
        let mut num_non_simple_profiled_functions = 0u64;
        let mut total_sample_count = 0u64;
        let mut stale_sample_count = 0u64;
        let mut inferred_sample_count = 0u64;
        let mut profiled_functions: Vec<FunctionId> = Vec::new();
        let mut printed_stale_header = false;

        for id in ctx.function_ids() {
            ctx.with_function(id, |function| {
                num_regular_functions += 1;

                if !function.is_simple() {
                    if function.has_profile() {
                        num_non_simple_profiled_functions += 1;
                    }
                    return;
                }

                if !function.has_profile() {
                    return;
                }

                let sample_count = function.raw_sample_count();
                total_sample_count += sample_count;

                if function.has_valid_profile() {
                    profiled_functions.push(id);
                    if function.has_inferred_profile() {
                        num_inferred_functions += 1;
                        inferred_sample_count += sample_count;
                    }
                } else {
                    if ctx.opts.report_stale {
                        if !printed_stale_header {
                            ctx.sink.info(format_args!("Functions with stale profile:"));
                            printed_stale_header = true;
                        }
                        ctx.sink.raw(format_args!("  {}", function.name()));
                    }
                    num_stale_profile_functions += 1;
                    stale_sample_count += sample_count;
                }
            });
        }

        ctx.stats
            .num_profiled_funcs
            .store(profiled_functions.len(), Ordering::Relaxed);
        ctx.stats
            .num_stale_profile_funcs
            .store(num_stale_profile_functions as usize, Ordering::Relaxed);

        let num_all_profiled = profiled_functions.len() as u64 + num_stale_profile_functions;
        ctx.sink.info(format_args!(
            "{num_all_profiled} out of {num_regular_functions} functions in the binary ({:.1}%) have non-empty execution profile",
            num_all_profiled as f64 / (num_regular_functions.max(1)) as f64 * 100.0
        ));
        if num_non_simple_profiled_functions > 0 {
            ctx.sink.info(format_args!(
                "{num_non_simple_profiled_functions} function{} with profile could not be optimized",
                if num_non_simple_profiled_functions == 1 { "" } else { "s" }
            ));
        }

        let num_all_stale = num_stale_profile_functions + num_inferred_functions;
        if num_all_stale > 0 {
            let pct_stale = num_all_stale as f64 / num_all_profiled.max(1) as f64 * 100.0;
            let over_threshold = pct_stale > f64::from(ctx.opts.stale_threshold_pct);
            fn report(
                sink: &crate::report::ReportSink,
                over_threshold: bool,
                args: std::fmt::Arguments<'_>,
            ) {
                if over_threshold {
                    sink.error(args);
                } else {
                    sink.warning(args);
                }
            }
            report(&ctx.sink, over_threshold, format_args!(
                "{num_all_stale} ({pct_stale:.1}% of all profiled) function{} have invalid (possibly stale) profile. Use -report-stale to see the list.",
                if num_all_stale == 1 { "" } else { "s" }
            ));
            if total_sample_count > 0 {
                report(&ctx.sink, over_threshold, format_args!(
                    "{} out of {total_sample_count} samples in the binary ({:.1}%) belong to functions with invalid (possibly stale) profile.",
                    stale_sample_count + inferred_sample_count,
                    (stale_sample_count + inferred_sample_count) as f64
                        / total_sample_count as f64
                        * 100.0
                ));
            }
            if over_threshold {
                return Err(Error::StaleProfile {
                    percent: pct_stale,
                    threshold: ctx.opts.stale_threshold_pct,
                });
            }
        }

        if num_inferred_functions > 0 {
            ctx.sink.info(format_args!(
                "inferred profile for {num_inferred_functions} ({:.2}% of profiled) functions responsible for {:.2}% samples ({inferred_sample_count} out of {total_sample_count})",
                100.0 * num_inferred_functions as f64 / num_all_profiled.max(1) as f64,
                100.0 * inferred_sample_count as f64 / total_sample_count.max(1) as f64,
            ));
        }

        // Top-called listing.
        if profiled_functions.len() > 10 && ctx.opts.verbosity >= 1 {
            ctx.sink.info(format_args!("top called functions are:"));
            let mut ranked = profiled_functions.clone();
            ranked.sort_by_key(|&id| {
                std::cmp::Reverse(
                    ctx.with_function(id, |f| f.known_execution_count())
                        .unwrap_or(0),
                )
            });
            for id in ranked.iter().take(ctx.opts.top_called_limit) {
                ctx.with_function(*id, |f| {
                    ctx.sink
                        .raw(format_args!("  {} : {}", f.name(), f.known_execution_count()));
                });
            }
        }

        // Functions ranked by dyno stats.
        if !ctx.opts.print_sorted_by.is_empty() {
            let keys = &ctx.opts.print_sorted_by;
            let mut ranked: Vec<(FunctionId, DynoStats)> = Vec::new();
            for id in ctx.function_ids() {
                ctx.with_function(id, |function| {
                    if function.is_simple()
                        && function.has_cfg()
                        && !function.is_ignored()
                        && function.has_valid_profile()
                    {
                        ranked.push((id, DynoStats::collect(function, ctx.isa.as_ref())));
                    }
                });
            }
            let ascending = ctx.opts.dyno_sort_ascending;
            ranked.sort_by(|a, b| {
                let less = a.1.less_than(&b.1, keys);
                let greater = b.1.less_than(&a.1, keys);
                let ord = match (less, greater) {
                    (true, _) => std::cmp::Ordering::Less,
                    (_, true) => std::cmp::Ordering::Greater,
                    _ => std::cmp::Ordering::Equal,
                };
                if ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });

            ctx.sink.info(format_args!("top functions sorted by dyno stats are:"));
            for (id, stats) in ranked.iter().take(100) {
                ctx.with_function(*id, |f| {
                    let mut values = String::new();
                    for (pos, key) in keys.iter().enumerate() {
                        if pos > 0 {
                            values.push_str(", ");
                        }
                        values.push_str(&format!("{key}={}", stats[*key]));
                    }
                    ctx.sink.raw(format_args!("  {} ({values})", f.name()));
                });
            }
        }

        // Suboptimal input layout: cold code in the middle of hot code.
        if ctx.opts.report_bad_layout > 0 {
            let mut suboptimal: Vec<(u64, FunctionId)> = Vec::new();
            for id in ctx.function_ids() {
                ctx.with_function(id, |function| {
                    if !function.has_valid_profile() {
                        return;
                    }
                    let hot_threshold = function.known_execution_count().max(1);
                    let mut hot_seen = false;
                    for &block in function.layout().blocks().iter().rev() {
                        let count = function.block(block).known_execution_count();
                        if !hot_seen && count > hot_threshold {
                            hot_seen = true;
                            continue;
                        }
                        if hot_seen && count == 0 {
                            suboptimal.push((function.function_score(), id));
                            break;
                        }
                    }
                });
            }
            if !suboptimal.is_empty() {
                suboptimal.sort_by(|a, b| b.0.cmp(&a.0));
                ctx.sink.info(format_args!(
                    "{} functions have cold code in the middle of hot code. Top functions are:",
                    suboptimal.len()
                ));
                for (_, id) in suboptimal.iter().take(ctx.opts.report_bad_layout) {
                    ctx.with_function(*id, |f| {
                        ctx.sink.raw(format_args!("  {}", f.name()));
                    });
                }
            }
        }

        Ok(())
    }
}

/// Reports profile flow-imbalance bias.
///
/// For every profiled block, compares the summed frequency of incoming edges against the
/// summed frequency of outgoing edges; a well-formed profile has them nearly equal. The pass
/// prints the mean and standard deviation of the relative imbalance and, at higher
/// verbosity, the worst-biased function.
#[derive(Debug, Default)]
pub struct PrintProfileStats;

impl PrintProfileStats {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        PrintProfileStats
    }
}

impl BinaryPass for PrintProfileStats {
    fn name(&self) -> &'static str {
        "print-profile-stats"
    }

    fn run(&self, ctx: &BinaryContext) -> Result<()> {
        // (incoming, outgoing) flow per block, per function.
        let mut flows: Vec<(FunctionId, Vec<(bool, u64, u64)>)> = Vec::new();

        for id in ctx.function_ids() {
            ctx.with_function(id, |function| {
                if function.block_count() == 0 || !function.is_simple() {
                    return;
                }
                let mut incoming = std::collections::HashMap::new();
                let mut outgoing = std::collections::HashMap::new();
                for block in function.block_ids() {
                    let bb = function.block(block);
                    let mut total_out = 0u64;
                    for (idx, &succ) in bb.successors().iter().enumerate() {
                        let Some(count) = bb.branch_info()[idx].count.known() else {
                            continue;
                        };
                        if count == 0 {
                            continue;
                        }
                        total_out += count;
                        *incoming.entry(succ).or_insert(0u64) += count;
                    }
                    outgoing.insert(block, total_out);
                }

                let per_block: Vec<(bool, u64, u64)> = function
                    .block_ids()
                    .map(|block| {
                        (
                            function.block(block).is_entry_point(),
                            incoming.get(&block).copied().unwrap_or(0),
                            outgoing.get(&block).copied().unwrap_or(0),
                        )
                    })
                    .collect();
                flows.push((id, per_block));
            });
        }

        // Mean over blocks with meaningful flow; entry blocks are excluded here.
        let mut mean = 0.0f64;
        let mut num_blocks = 0usize;
        let mut worst_bias = 0.0f64;
        let mut worst_bias_func: Option<FunctionId> = None;

        for (id, blocks) in &flows {
            let mut func_sum = 0.0;
            let mut func_blocks = 0usize;
            for &(is_entry, incoming, outgoing) in blocks {
                if incoming < 100 || outgoing == 0 || is_entry {
                    continue;
                }
                func_blocks += 1;
                func_sum += ((outgoing as f64 - incoming as f64) / incoming as f64).abs();
            }
            mean += func_sum;
            num_blocks += func_blocks;
            if func_blocks > 0 {
                let func_mean = func_sum / func_blocks as f64;
                if func_mean > worst_bias {
                    worst_bias = func_mean;
                    worst_bias_func = Some(*id);
                }
            }
        }
        if num_blocks > 0 {
            mean /= num_blocks as f64;
        }

        // Standard deviation in a second sweep.
        let mut variance = 0.0f64;
        let mut considered = 0usize;
        for (_, blocks) in &flows {
            for &(_, incoming, outgoing) in blocks {
                if incoming < 100 || outgoing == 0 {
                    continue;
                }
                considered += 1;
                let imbalance = ((outgoing as f64 - incoming as f64) / incoming as f64).abs();
                variance += (imbalance - mean).powi(2);
            }
        }
        if considered > 0 {
            variance = (variance / considered as f64).sqrt();
        }

        ctx.sink.info(format_args!(
            "Profile bias score: {:.4}% StDev: {:.4}%",
            100.0 * mean,
            100.0 * variance
        ));
        if let Some(worst) = worst_bias_func {
            if ctx.opts.verbosity >= 1 {
                ctx.with_function(worst, |f| {
                    ctx.sink.raw(format_args!(
                        "Worst average bias observed in {}",
                        f.name()
                    ));
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cfg::ExecCount,
        config::OptConfig,
        test::{sink_text, test_context_buffered, test_context_with_buffered, FunctionBuilder},
    };

    #[test]
    fn test_profile_summary_counts() {
        let (ctx, buffer) = test_context_buffered();
        let valid = FunctionBuilder::new("hot", 0x1000)
            .block(|b| b.exec(100).ret())
            .build_into(&ctx);
        ctx.with_function_mut(valid, |f| f.set_raw_sample_count(500));

        let stale = FunctionBuilder::new("stale", 0x2000)
            .block(|b| b.ret())
            .build_into(&ctx);
        ctx.with_function_mut(stale, |f| {
            f.set_execution_count(ExecCount::new(10));
            f.set_raw_sample_count(100);
            f.set_valid_profile(false);
        });

        FunctionBuilder::new("noprofile", 0x3000)
            .block(|b| b.ret())
            .build_into(&ctx);

        PrintProgramStats::new().run(&ctx).unwrap();

        assert_eq!(ctx.stats.num_profiled_funcs.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.stats.num_stale_profile_funcs.load(Ordering::Relaxed), 1);
        let text = sink_text(&buffer);
        assert!(text.contains("2 out of 3 functions"));
        assert!(text.contains("stale"));
    }

    #[test]
    fn test_stale_threshold_aborts_pipeline() {
        let (ctx, _buffer) = test_context_with_buffered(OptConfig {
            stale_threshold_pct: 10,
            ..OptConfig::default()
        });
        let stale = FunctionBuilder::new("stale", 0x1000)
            .block(|b| b.ret())
            .build_into(&ctx);
        ctx.with_function_mut(stale, |f| {
            f.set_execution_count(ExecCount::new(10));
            f.set_valid_profile(false);
        });

        let err = PrintProgramStats::new().run(&ctx).unwrap_err();
        match err {
            Error::StaleProfile { percent, threshold } => {
                assert!(percent > 10.0);
                assert_eq!(threshold, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stale_below_threshold_is_warning_only() {
        let (ctx, buffer) = test_context_buffered();
        let stale = FunctionBuilder::new("stale", 0x1000)
            .block(|b| b.ret())
            .build_into(&ctx);
        ctx.with_function_mut(stale, |f| {
            f.set_execution_count(ExecCount::new(10));
            f.set_valid_profile(false);
        });

        // Default threshold is 100%, which cannot be exceeded.
        PrintProgramStats::new().run(&ctx).unwrap();
        assert!(sink_text(&buffer).contains("REFORGE-WARNING"));
    }

    #[test]
    fn test_profile_bias_score_reported() {
        let (ctx, buffer) = test_context_buffered();
        FunctionBuilder::new("balanced", 0x1000)
            .block(|b| b.exec(200).jump(1).count(200))
            .block(|b| b.exec(200).jump(2).count(200))
            .block(|b| b.exec(200).ret())
            .build_into(&ctx);

        PrintProfileStats::new().run(&ctx).unwrap();
        let text = sink_text(&buffer);
        assert!(text.contains("Profile bias score: 0.0000%"));
    }
}
