//! Optimizer configuration.
//!
//! The library deliberately owns no command-line surface; a front end maps its flags onto
//! [`OptConfig`] and hands it to the [`BinaryContext`](crate::binary::BinaryContext). Field
//! defaults match the behavior of running the optimizer with no flags given.

use bitflags::bitflags;
use strum::{Display, EnumString};

use crate::{dynostats::DynoCategory, report::ReportSink};

/// Basic block layout strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum LayoutMode {
    /// Do not reorder basic blocks.
    None,
    /// Lay out blocks in reverse order (stress testing; needs no profile).
    Reverse,
    /// Profile-optimal layout minimizing taken branches.
    Optimize,
    /// Profile-optimal layout prioritizing branch prediction.
    OptimizeBranch,
    /// Legacy cache-optimizing layout; deprecated alias resolved to [`ExtTsp`](Self::ExtTsp).
    #[strum(serialize = "cache")]
    OptimizeCache,
    /// Layout optimizing instruction-cache behavior via extended-TSP scoring.
    ExtTsp,
    /// Random cluster order (stress testing; needs no profile).
    ClusterShuffle,
}

impl LayoutMode {
    /// Resolves deprecated aliases, warning through `sink` when one is encountered.
    #[must_use]
    pub fn canonicalize(self, sink: &ReportSink) -> LayoutMode {
        if self == LayoutMode::OptimizeCache {
            sink.warning(format_args!(
                "layout mode 'cache' is deprecated, please use 'ext-tsp' instead"
            ));
            LayoutMode::ExtTsp
        } else {
            self
        }
    }
}

/// Rewrite policy for the conditional-tail-call simplifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum SctcMode {
    /// Always rewrite qualifying candidates.
    Always,
    /// Rewrite only when the branch direction is preserved.
    PreserveDirection,
    /// Use observed branch-taken frequency to decide.
    Heuristic,
}

bitflags! {
    /// Independently toggled peephole sub-passes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeepholeFlags: u8 {
        /// Remove double jumps when able.
        const DOUBLE_JUMPS = 0b001;
        /// Insert traps after indirect tail calls.
        const TAILCALL_TRAPS = 0b010;
        /// Remove useless conditional branches.
        const USELESS_BRANCHES = 0b100;
    }
}

/// All knobs consumed by the pass pipeline.
///
/// # Examples
///
/// ```rust
/// use reforge::config::{LayoutMode, OptConfig, PeepholeFlags};
///
/// let config = OptConfig {
///     layout: LayoutMode::ExtTsp,
///     peepholes: PeepholeFlags::all(),
///     ..OptConfig::default()
/// };
/// assert_eq!(config.tsp_threshold, 10);
/// ```
#[derive(Debug, Clone)]
pub struct OptConfig {
    /// Basic block layout strategy.
    pub layout: LayoutMode,
    /// Minimum function execution count for reordering eligibility.
    pub exec_count_threshold: u64,
    /// Enabled peephole sub-passes.
    pub peepholes: PeepholeFlags,
    /// Maximum block count for which the exact layout solver runs.
    pub tsp_threshold: usize,
    /// Maximum tolerated percentage of stale-profile functions.
    pub stale_threshold_pct: u32,
    /// Conditional-tail-call rewrite policy.
    pub sctc_mode: SctcMode,
    /// Output verbosity; higher values enable per-function diagnostics.
    pub verbosity: u32,
    /// Use the clustering variant geared towards minimizing branches.
    pub min_branch_clusters: bool,
    /// Print reordering statistics for the top N functions (0 disables).
    pub print_function_statistics: usize,
    /// Print functions whose estimated size exceeds their allocated slot.
    pub print_large_functions: bool,
    /// Print the list of functions with stale profiles.
    pub report_stale: bool,
    /// Maximum functions listed in the top-called report.
    pub top_called_limit: usize,
    /// Print the top N functions with suboptimal input layout (0 disables).
    pub report_bad_layout: usize,
    /// Memcpy specialization site specs, `function:site:site…` with 1-based sites.
    pub memcpy_spec: Vec<String>,
    /// Seed for the cluster-shuffle layout.
    pub shuffle_seed: u64,
    /// Print functions ranked by these dyno-stats keys (empty disables the report).
    pub print_sorted_by: Vec<DynoCategory>,
    /// Rank ascending instead of descending in the dyno-stats report.
    pub dyno_sort_ascending: bool,
}

impl Default for OptConfig {
    fn default() -> Self {
        OptConfig {
            layout: LayoutMode::None,
            exec_count_threshold: 0,
            peepholes: PeepholeFlags::empty(),
            tsp_threshold: 10,
            stale_threshold_pct: 100,
            sctc_mode: SctcMode::Always,
            verbosity: 0,
            min_branch_clusters: false,
            print_function_statistics: 0,
            print_large_functions: false,
            report_stale: false,
            top_called_limit: 100,
            report_bad_layout: 0,
            memcpy_spec: Vec::new(),
            shuffle_seed: 0,
            print_sorted_by: Vec::new(),
            dyno_sort_ascending: false,
        }
    }
}
