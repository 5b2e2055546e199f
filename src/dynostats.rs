//! Dynamic execution statistics ("dyno stats").
//!
//! A [`DynoStats`] is a fixed vector of execution-weighted counters computed per function
//! from block execution counts and instruction classification. The counters rank functions
//! for reporting ("top functions sorted by taken branches") and let before/after pipelines be
//! compared by key subsets.
//!
//! Counters only accumulate from blocks that carry profile data; unprofiled blocks contribute
//! nothing rather than being silently treated as zero-hot.

use std::{
    fmt,
    ops::{Add, Index},
};

use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

use crate::{cfg::BinaryFunction, isa::InstructionSemantics};

/// Categories of dynamic execution counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumCount)]
#[strum(serialize_all = "kebab-case")]
pub enum DynoCategory {
    /// Instructions executed.
    ExecutedInstructions,
    /// Branch instructions executed.
    ExecutedBranches,
    /// Branches taken.
    TakenBranches,
    /// Forward conditional branches executed.
    ForwardBranches,
    /// Forward conditional branches taken.
    TakenForwardBranches,
    /// Backward conditional branches executed.
    BackwardBranches,
    /// Backward conditional branches taken.
    TakenBackwardBranches,
    /// Unconditional branches executed.
    UncondBranches,
    /// Direct function calls executed.
    FunctionCalls,
    /// Indirect calls executed.
    IndirectCalls,
    /// Load instructions executed.
    Loads,
    /// Store instructions executed.
    Stores,
    /// Jump-table branches taken.
    JumpTableBranches,
}

/// Fixed vector of execution-weighted counters for one function (or a program total).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DynoStats {
    counters: [u64; DynoCategory::COUNT],
}

impl DynoStats {
    /// Computes the statistics of a function from its profile and instruction classes.
    ///
    /// # Arguments
    ///
    /// * `function` - The function to measure
    /// * `isa` - Instruction classification oracle
    #[must_use]
    pub fn collect(function: &BinaryFunction, isa: &dyn InstructionSemantics) -> Self {
        let mut stats = DynoStats::default();

        for id in function.block_ids() {
            let bb = function.block(id);
            let Some(exec) = bb.execution_count().known() else {
                continue;
            };

            stats.add_to(
                DynoCategory::ExecutedInstructions,
                exec * bb.num_non_pseudos() as u64,
            );

            for inst in bb.instructions() {
                if inst.is_pseudo() {
                    continue;
                }
                if isa.is_call(inst) {
                    if isa.is_indirect_call(inst) {
                        stats.add_to(DynoCategory::IndirectCalls, exec);
                    } else {
                        stats.add_to(DynoCategory::FunctionCalls, exec);
                    }
                }
                if isa.may_load(inst) {
                    stats.add_to(DynoCategory::Loads, exec);
                }
                if isa.may_store(inst) {
                    stats.add_to(DynoCategory::Stores, exec);
                }
            }

            if bb.has_jump_table() {
                let taken: u64 = bb
                    .branch_info()
                    .iter()
                    .map(|bi| bi.count.known_or_zero())
                    .sum();
                stats.add_to(DynoCategory::JumpTableBranches, taken);
                continue;
            }

            match bb.succ_size() {
                1 => {
                    let has_uncond_jump = bb
                        .last_non_pseudo()
                        .is_some_and(|inst| isa.is_unconditional_branch(inst));
                    if has_uncond_jump {
                        stats.add_to(DynoCategory::ExecutedBranches, exec);
                        stats.add_to(DynoCategory::TakenBranches, exec);
                        stats.add_to(DynoCategory::UncondBranches, exec);
                    }
                }
                2 => {
                    let taken_succ = bb.successors()[0];
                    let taken = bb.taken_branch_info().count.known_or_zero();
                    stats.add_to(DynoCategory::ExecutedBranches, exec);
                    stats.add_to(DynoCategory::TakenBranches, taken);
                    if function.is_forward_branch(id, taken_succ) {
                        stats.add_to(DynoCategory::ForwardBranches, exec);
                        stats.add_to(DynoCategory::TakenForwardBranches, taken);
                    } else {
                        stats.add_to(DynoCategory::BackwardBranches, exec);
                        stats.add_to(DynoCategory::TakenBackwardBranches, taken);
                    }
                }
                _ => {}
            }
        }
        stats
    }

    fn add_to(&mut self, category: DynoCategory, amount: u64) {
        self.counters[category as usize] = self.counters[category as usize].saturating_add(amount);
    }

    /// Compares two stats over a subset of categories, lexicographically in key order.
    ///
    /// # Arguments
    ///
    /// * `other` - Stats to compare against
    /// * `keys` - Categories to compare, most significant first
    #[must_use]
    pub fn less_than(&self, other: &DynoStats, keys: &[DynoCategory]) -> bool {
        for &key in keys {
            if self[key] != other[key] {
                return self[key] < other[key];
            }
        }
        false
    }
}

impl Index<DynoCategory> for DynoStats {
    type Output = u64;

    fn index(&self, category: DynoCategory) -> &u64 {
        &self.counters[category as usize]
    }
}

impl PartialOrd for DynoStats {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DynoStats {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.counters.cmp(&other.counters)
    }
}

impl Add for DynoStats {
    type Output = DynoStats;

    fn add(self, rhs: DynoStats) -> DynoStats {
        let mut sum = DynoStats::default();
        for (idx, slot) in sum.counters.iter_mut().enumerate() {
            *slot = self.counters[idx].saturating_add(rhs.counters[idx]);
        }
        sum
    }
}

impl fmt::Display for DynoStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for category in DynoCategory::iter() {
            writeln!(f, "{:>16} : {}", self[category], category)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cfg::CondCode, isa::X64, test::FunctionBuilder};

    #[test]
    fn test_collect_counts_branches_and_calls() {
        let isa = X64::new();
        let f = FunctionBuilder::new("stats", 0x1000)
            .block(|b| b.exec(100).push_call("helper").cond(CondCode::Eq, 2, 1).counts(70, 30))
            .block(|b| b.exec(30).jump(3))
            .block(|b| b.exec(70).jump(3))
            .block(|b| b.exec(100).ret())
            .build();

        let stats = DynoStats::collect(&f, &isa);
        assert_eq!(stats[DynoCategory::FunctionCalls], 100);
        assert_eq!(stats[DynoCategory::ExecutedBranches], 100 + 30 + 70);
        assert_eq!(stats[DynoCategory::TakenBranches], 70 + 30 + 70);
        // Block 0's taken edge goes to block 2, forward in layout.
        assert_eq!(stats[DynoCategory::TakenForwardBranches], 70);
        assert_eq!(stats[DynoCategory::BackwardBranches], 0);
    }

    #[test]
    fn test_unprofiled_blocks_contribute_nothing() {
        let isa = X64::new();
        let f = FunctionBuilder::new("cold", 0x1000)
            .block(|b| b.push_call("helper").jump(1))
            .block(|b| b.ret())
            .build();

        assert_eq!(DynoStats::collect(&f, &isa), DynoStats::default());
    }

    #[test]
    fn test_less_than_key_subset() {
        let mut a = DynoStats::default();
        let mut b = DynoStats::default();
        a.add_to(DynoCategory::TakenBranches, 10);
        b.add_to(DynoCategory::TakenBranches, 20);
        a.add_to(DynoCategory::Loads, 99);

        assert!(a.less_than(&b, &[DynoCategory::TakenBranches]));
        assert!(!a.less_than(&b, &[DynoCategory::Loads]));
        assert!(a < b || b < a);
    }

    #[test]
    fn test_totals_add_up() {
        let mut a = DynoStats::default();
        let mut b = DynoStats::default();
        a.add_to(DynoCategory::Stores, 5);
        b.add_to(DynoCategory::Stores, 7);
        assert_eq!((a + b)[DynoCategory::Stores], 12);
    }
}
