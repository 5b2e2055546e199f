//! Basic block reordering strategies.
//!
//! The layout engine is a closed set of tagged strategy variants selected by configuration -
//! no open-ended inheritance. Every variant implements the same contract: given a function,
//! compute a new linear order over exactly the blocks of the current layout.
//!
//! | Strategy | Objective |
//! |----------|-----------|
//! | [`Reverse`](ReorderStrategy::Reverse) | Exact reverse of the input order (stress testing) |
//! | [`ExactTsp`](ReorderStrategy::ExactTsp) | Optimal fall-through weight for small functions |
//! | [`Greedy`](ReorderStrategy::Greedy) | Cluster-then-arrange heuristics |
//! | [`ExtTsp`](ReorderStrategy::ExtTsp) | Instruction-cache locality via extended-TSP scoring |
//! | [`Shuffle`](ReorderStrategy::Shuffle) | Random cluster order (stress testing) |

use std::collections::HashMap;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    binary::SizeEstimator,
    cfg::{BinaryFunction, BlockId},
};

/// Greedy clustering variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterVariant {
    /// Pure profile/heat-based greedy clustering: hottest edges merge first.
    ProfileGreedy,
    /// Clustering biased towards sources with few outgoing edges, minimizing the number of
    /// surviving inter-cluster branches.
    MinBranch,
}

/// Objective used to arrange clusters after greedy clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreedyObjective {
    /// Minimize taken branches: hot clusters first, by average execution count.
    TakenBranches,
    /// Prioritize branch prediction: chain clusters along mispredict-heavy edges.
    Mispredictions,
    /// Prioritize instruction-cache behavior: hot clusters packed before cold ones.
    CacheLocality,
}

/// A block reordering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderStrategy {
    /// Exact reverse of the input order, independent of profile validity.
    Reverse,
    /// Exact maximum-fall-through-weight solution; exponential in block count, only for
    /// functions below the configured threshold.
    ExactTsp,
    /// Greedy clustering followed by objective-driven cluster arrangement.
    Greedy {
        /// Clustering variant.
        variant: ClusterVariant,
        /// Cluster arrangement objective.
        objective: GreedyObjective,
    },
    /// Chain-merging layout maximizing the extended-TSP locality score.
    ExtTsp,
    /// Greedy clustering followed by a seeded random shuffle of the non-entry clusters.
    Shuffle {
        /// Clustering variant.
        variant: ClusterVariant,
        /// Deterministic shuffle seed.
        seed: u64,
    },
}

/// Cap above which the quadratic chain-merging of ext-TSP falls back to density ordering.
const EXT_TSP_MAX_BLOCKS: usize = 1024;

/// Cap protecting the exponential exact solver against misconfiguration; the DP table is
/// `2^n * n` entries.
const EXACT_TSP_MAX_BLOCKS: usize = 16;

impl ReorderStrategy {
    /// Computes a new emission order for the blocks of `function`.
    ///
    /// # Arguments
    ///
    /// * `function` - Function whose layout is being recomputed
    /// * `estimator` - Size estimator for distance-sensitive scoring
    ///
    /// # Returns
    ///
    /// A permutation of the current layout's blocks.
    #[must_use]
    pub fn compute_order(
        &self,
        function: &BinaryFunction,
        estimator: &SizeEstimator<'_>,
    ) -> Vec<BlockId> {
        match *self {
            ReorderStrategy::Reverse => {
                let mut order: Vec<BlockId> = function.layout().blocks().to_vec();
                order.reverse();
                order
            }
            ReorderStrategy::ExactTsp => solve_exact_tsp(function),
            ReorderStrategy::Greedy { variant, objective } => {
                let clusters = clusterize(function, variant);
                arrange_clusters(function, clusters, objective)
            }
            ReorderStrategy::ExtTsp => ext_tsp_order(function, estimator),
            ReorderStrategy::Shuffle { variant, seed } => {
                let mut clusters = clusterize(function, variant);
                if clusters.len() > 1 {
                    let mut rng = StdRng::seed_from_u64(seed);
                    clusters[1..].shuffle(&mut rng);
                }
                clusters.into_iter().flatten().collect()
            }
        }
    }
}

/// Sums the fall-through weight of consecutive block pairs in `order`.
///
/// This is the objective the exact solver maximizes; exposed so callers can compare
/// heuristic orders against the optimum.
#[must_use]
pub fn fallthrough_weight(function: &BinaryFunction, order: &[BlockId]) -> u64 {
    order
        .windows(2)
        .map(|pair| edge_count(function, pair[0], pair[1]))
        .sum()
}

fn edge_count(function: &BinaryFunction, src: BlockId, dst: BlockId) -> u64 {
    function
        .block(src)
        .branch_info_for(dst)
        .map_or(0, |bi| bi.count.known_or_zero())
}

// ── Exact solver ────────────────────────────────────────────────────────

/// Held-Karp dynamic program maximizing total fall-through weight, entry block pinned first.
fn solve_exact_tsp(function: &BinaryFunction) -> Vec<BlockId> {
    let blocks: Vec<BlockId> = function.layout().blocks().to_vec();
    let n = blocks.len();
    if n <= 2 || n > EXACT_TSP_MAX_BLOCKS {
        return blocks;
    }

    let mut weight = vec![vec![0u64; n]; n];
    for (i, &src) in blocks.iter().enumerate() {
        for (j, &dst) in blocks.iter().enumerate() {
            if i != j {
                weight[i][j] = edge_count(function, src, dst);
            }
        }
    }

    let full = 1usize << n;
    // dp[mask][last]: best weight of a path over `mask` ending at `last`, starting at 0.
    let mut dp = vec![vec![u64::MAX; n]; full];
    let mut parent = vec![vec![usize::MAX; n]; full];
    dp[1][0] = 0;

    for mask in 1..full {
        if mask & 1 == 0 {
            continue;
        }
        for last in 0..n {
            if mask & (1 << last) == 0 || dp[mask][last] == u64::MAX {
                continue;
            }
            for next in 1..n {
                if mask & (1 << next) != 0 {
                    continue;
                }
                let next_mask = mask | (1 << next);
                let candidate = dp[mask][last].saturating_add(weight[last][next]);
                if dp[next_mask][next] == u64::MAX || candidate > dp[next_mask][next] {
                    dp[next_mask][next] = candidate;
                    parent[next_mask][next] = last;
                }
            }
        }
    }

    let final_mask = full - 1;
    let mut best_last = 0;
    let mut best = 0u64;
    for last in 0..n {
        if dp[final_mask][last] != u64::MAX && dp[final_mask][last] >= best {
            best = dp[final_mask][last];
            best_last = last;
        }
    }

    let mut path = Vec::with_capacity(n);
    let mut mask = final_mask;
    let mut last = best_last;
    while last != usize::MAX {
        path.push(blocks[last]);
        let prev = parent[mask][last];
        mask &= !(1 << last);
        last = prev;
    }
    path.reverse();
    debug_assert_eq!(path.len(), n);
    path
}

// ── Greedy clustering ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Edge {
    src: BlockId,
    dst: BlockId,
    count: u64,
    mispredicted: u64,
}

fn collect_edges(function: &BinaryFunction) -> Vec<Edge> {
    let mut edges = Vec::new();
    for &src in function.layout().blocks() {
        let bb = function.block(src);
        for (idx, &dst) in bb.successors().iter().enumerate() {
            if src == dst {
                continue;
            }
            let info = bb.branch_info()[idx];
            edges.push(Edge {
                src,
                dst,
                count: info.count.known_or_zero(),
                mispredicted: info.mispredicted.known_or_zero(),
            });
        }
    }
    edges
}

/// Greedy cluster formation: hottest edges first, merging only when the edge connects the
/// tail of one cluster to the head of another.
fn clusterize(function: &BinaryFunction, variant: ClusterVariant) -> Vec<Vec<BlockId>> {
    let order: Vec<BlockId> = function.layout().blocks().to_vec();
    if order.is_empty() {
        return Vec::new();
    }
    let entry = order[0];
    let position: HashMap<BlockId, usize> =
        order.iter().enumerate().map(|(idx, &id)| (id, idx)).collect();

    let mut edges = collect_edges(function);
    match variant {
        ClusterVariant::ProfileGreedy => edges.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| position[&a.src].cmp(&position[&b.src]))
                .then_with(|| position[&a.dst].cmp(&position[&b.dst]))
        }),
        ClusterVariant::MinBranch => edges.sort_by(|a, b| {
            let a_out = function.block(a.src).succ_size();
            let b_out = function.block(b.src).succ_size();
            b.count
                .cmp(&a.count)
                .then_with(|| a_out.cmp(&b_out))
                .then_with(|| position[&a.src].cmp(&position[&b.src]))
                .then_with(|| position[&a.dst].cmp(&position[&b.dst]))
        }),
    }

    let mut clusters: Vec<Vec<BlockId>> = order.iter().map(|&id| vec![id]).collect();
    let mut cluster_of: HashMap<BlockId, usize> =
        order.iter().enumerate().map(|(idx, &id)| (id, idx)).collect();

    for edge in edges {
        if edge.dst == entry {
            continue;
        }
        let ca = cluster_of[&edge.src];
        let cb = cluster_of[&edge.dst];
        if ca == cb {
            continue;
        }
        let tail_matches = clusters[ca].last() == Some(&edge.src);
        let head_matches = clusters[cb].first() == Some(&edge.dst);
        if !tail_matches || !head_matches {
            continue;
        }

        let absorbed = std::mem::take(&mut clusters[cb]);
        for &id in &absorbed {
            cluster_of.insert(id, ca);
        }
        clusters[ca].extend(absorbed);
    }

    clusters.retain(|c| !c.is_empty());
    // The entry cluster leads regardless of heat.
    if let Some(pos) = clusters.iter().position(|c| c.contains(&entry)) {
        clusters.swap(0, pos);
    }
    clusters
}

fn cluster_avg_exec(function: &BinaryFunction, cluster: &[BlockId]) -> u64 {
    if cluster.is_empty() {
        return 0;
    }
    let total: u64 = cluster
        .iter()
        .map(|&id| function.block(id).known_execution_count())
        .sum();
    total / cluster.len() as u64
}

/// Arranges clusters according to the selected objective; the entry cluster stays first.
fn arrange_clusters(
    function: &BinaryFunction,
    mut clusters: Vec<Vec<BlockId>>,
    objective: GreedyObjective,
) -> Vec<BlockId> {
    if clusters.len() <= 1 {
        return clusters.into_iter().flatten().collect();
    }

    match objective {
        GreedyObjective::TakenBranches => {
            let mut rest = clusters.split_off(1);
            rest.sort_by_key(|c| std::cmp::Reverse(cluster_avg_exec(function, c)));
            clusters.extend(rest);
        }
        GreedyObjective::Mispredictions => {
            let edges = collect_edges(function);
            let rest = clusters.split_off(1);
            let mut remaining: Vec<Vec<BlockId>> = rest;
            while !remaining.is_empty() {
                let current = clusters.last().expect("entry cluster present");
                let best = remaining
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, candidate)| {
                        let mispred: u64 = edges
                            .iter()
                            .filter(|e| current.contains(&e.src) && candidate.contains(&e.dst))
                            .map(|e| e.mispredicted)
                            .sum();
                        (mispred, cluster_avg_exec(function, candidate))
                    })
                    .map(|(idx, _)| idx)
                    .unwrap_or(0);
                clusters.push(remaining.remove(best));
            }
        }
        GreedyObjective::CacheLocality => {
            let rest = clusters.split_off(1);
            let (mut hot, cold): (Vec<_>, Vec<_>) = rest
                .into_iter()
                .partition(|c| cluster_avg_exec(function, c) > 0);
            hot.sort_by_key(|c| std::cmp::Reverse(cluster_avg_exec(function, c)));
            clusters.extend(hot);
            clusters.extend(cold);
        }
    }
    clusters.into_iter().flatten().collect()
}

// ── Extended TSP ────────────────────────────────────────────────────────

/// Extended-TSP scoring constants: full credit for fall-throughs, partial
/// distance-decayed credit for short forward and backward jumps.
const FORWARD_DISTANCE: f64 = 1024.0;
const BACKWARD_DISTANCE: f64 = 640.0;
const JUMP_WEIGHT: f64 = 0.1;

fn ext_tsp_order(function: &BinaryFunction, estimator: &SizeEstimator<'_>) -> Vec<BlockId> {
    let order: Vec<BlockId> = function.layout().blocks().to_vec();
    if order.len() <= 2 || order.len() > EXT_TSP_MAX_BLOCKS {
        return order;
    }
    let entry = order[0];

    let sizes: HashMap<BlockId, u64> = order
        .iter()
        .map(|&id| (id, estimator.estimate_block(function.block(id))))
        .collect();
    let edges = collect_edges(function);

    let mut chains: Vec<Vec<BlockId>> = order.iter().map(|&id| vec![id]).collect();

    loop {
        let mut best_gain = 0.0f64;
        let mut best_pair: Option<(usize, usize)> = None;

        for i in 0..chains.len() {
            for j in 0..chains.len() {
                if i == j || chains[j].contains(&entry) {
                    // The entry chain can only ever be the front of a merge.
                    continue;
                }
                let base = ext_tsp_score(&chains[i], &sizes, &edges)
                    + ext_tsp_score(&chains[j], &sizes, &edges);
                let mut merged = chains[i].clone();
                merged.extend_from_slice(&chains[j]);
                let gain = ext_tsp_score(&merged, &sizes, &edges) - base;
                if gain > best_gain + 1e-9 {
                    best_gain = gain;
                    best_pair = Some((i, j));
                }
            }
        }

        let Some((i, j)) = best_pair else { break };
        let absorbed = std::mem::take(&mut chains[j]);
        chains[i].extend(absorbed);
        chains.retain(|c| !c.is_empty());
    }

    // Entry chain first, remaining chains by heat.
    if let Some(pos) = chains.iter().position(|c| c.contains(&entry)) {
        chains.swap(0, pos);
    }
    if chains.len() > 1 {
        let mut rest = chains.split_off(1);
        rest.sort_by_key(|c| std::cmp::Reverse(cluster_avg_exec(function, c)));
        chains.extend(rest);
    }
    chains.into_iter().flatten().collect()
}

/// Scores a chain: fall-throughs earn their full weight, short jumps earn distance-decayed
/// partial credit.
fn ext_tsp_score(chain: &[BlockId], sizes: &HashMap<BlockId, u64>, edges: &[Edge]) -> f64 {
    if chain.len() < 2 {
        return 0.0;
    }
    let mut offset = 0u64;
    let mut offsets: HashMap<BlockId, (u64, u64)> = HashMap::with_capacity(chain.len());
    for &id in chain {
        let size = sizes[&id];
        offsets.insert(id, (offset, offset + size));
        offset += size;
    }

    let mut score = 0.0;
    for edge in edges {
        let (Some(&(_, src_end)), Some(&(dst_start, _))) =
            (offsets.get(&edge.src), offsets.get(&edge.dst))
        else {
            continue;
        };
        let weight = edge.count as f64;
        if src_end == dst_start {
            score += weight;
        } else if dst_start > src_end {
            let dist = (dst_start - src_end) as f64;
            if dist < FORWARD_DISTANCE {
                score += weight * JUMP_WEIGHT * (1.0 - dist / FORWARD_DISTANCE);
            }
        } else {
            let dist = (src_end - dst_start) as f64;
            if dist < BACKWARD_DISTANCE {
                score += weight * JUMP_WEIGHT * (1.0 - dist / BACKWARD_DISTANCE);
            }
        }
    }
    score
}
