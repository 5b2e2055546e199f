//! Profile-derived execution counts with an explicit "no profile" state.
//!
//! Every count that originates from an execution profile uses [`ExecCount`] instead of a raw
//! integer. The distinction between "executed zero times" and "no profile data available" is
//! load-bearing throughout the pass pipeline: simplification decisions may treat unprofiled
//! edges as zero weight, but reporting and eligibility checks must not.

use std::fmt;
use std::ops::AddAssign;

/// An execution count that is either a known value or the "no profile" sentinel.
///
/// Arithmetic helpers never silently conflate the sentinel with zero; callers that want
/// zero-weight semantics must ask for them explicitly via [`known_or_zero`](Self::known_or_zero).
///
/// # Examples
///
/// ```rust
/// use reforge::cfg::ExecCount;
///
/// let hot = ExecCount::new(1500);
/// let unknown = ExecCount::NO_PROFILE;
///
/// assert!(hot.is_profiled());
/// assert!(!unknown.is_profiled());
/// assert_eq!(unknown.known_or_zero(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecCount(Option<u64>);

impl ExecCount {
    /// The sentinel for counts with no associated profile data.
    pub const NO_PROFILE: ExecCount = ExecCount(None);

    /// A known count of zero. Distinct from [`NO_PROFILE`](Self::NO_PROFILE).
    pub const ZERO: ExecCount = ExecCount(Some(0));

    /// Creates a known execution count.
    #[must_use]
    pub const fn new(count: u64) -> Self {
        ExecCount(Some(count))
    }

    /// Returns the known value, or `None` when no profile data is attached.
    #[must_use]
    pub const fn known(self) -> Option<u64> {
        self.0
    }

    /// Returns the known value, treating missing profile data as zero.
    ///
    /// Use only where the caller has explicitly decided that unprofiled means cold
    /// (e.g. simplification weight decisions); never for "has profile" reporting.
    #[must_use]
    pub const fn known_or_zero(self) -> u64 {
        match self.0 {
            Some(count) => count,
            None => 0,
        }
    }

    /// Returns `true` if this count carries real profile data.
    #[must_use]
    pub const fn is_profiled(self) -> bool {
        self.0.is_some()
    }

    /// Adds a known count, keeping the sentinel sticky: adding anything to
    /// `NO_PROFILE` yields the other operand's profile state unchanged only if
    /// both sides are known.
    #[must_use]
    pub fn saturating_add(self, other: ExecCount) -> ExecCount {
        match (self.0, other.0) {
            (Some(a), Some(b)) => ExecCount(Some(a.saturating_add(b))),
            _ => ExecCount::NO_PROFILE,
        }
    }

    /// Subtracts `amount` from a known count, clamping at zero. The sentinel is preserved.
    #[must_use]
    pub fn saturating_sub(self, amount: u64) -> ExecCount {
        ExecCount(self.0.map(|c| c.saturating_sub(amount)))
    }
}

impl Default for ExecCount {
    fn default() -> Self {
        ExecCount::NO_PROFILE
    }
}

impl AddAssign<u64> for ExecCount {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = Some(self.known_or_zero().saturating_add(rhs));
    }
}

impl fmt::Display for ExecCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(count) => write!(f, "{count}"),
            None => f.write_str("<no profile>"),
        }
    }
}

/// Per-edge branch profile attached to a successor entry of a basic block.
///
/// The `count` is the number of times the edge was taken; `mispredicted` is the number of
/// times the hardware branch predictor got it wrong. Both may independently be
/// [`ExecCount::NO_PROFILE`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchInfo {
    /// Times the edge was taken.
    pub count: ExecCount,
    /// Times the branch was mispredicted.
    pub mispredicted: ExecCount,
}

impl BranchInfo {
    /// Creates branch info with known taken and mispredict counts.
    #[must_use]
    pub const fn new(count: u64, mispredicted: u64) -> Self {
        BranchInfo {
            count: ExecCount::new(count),
            mispredicted: ExecCount::new(mispredicted),
        }
    }

    /// Branch info carrying no profile data at all.
    #[must_use]
    pub const fn no_profile() -> Self {
        BranchInfo {
            count: ExecCount::NO_PROFILE,
            mispredicted: ExecCount::NO_PROFILE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_distinct_from_zero() {
        assert_ne!(ExecCount::NO_PROFILE, ExecCount::ZERO);
        assert!(!ExecCount::NO_PROFILE.is_profiled());
        assert!(ExecCount::ZERO.is_profiled());
    }

    #[test]
    fn test_known_or_zero() {
        assert_eq!(ExecCount::NO_PROFILE.known_or_zero(), 0);
        assert_eq!(ExecCount::new(42).known_or_zero(), 42);
    }

    #[test]
    fn test_saturating_add_is_sentinel_sticky() {
        let sum = ExecCount::new(10).saturating_add(ExecCount::NO_PROFILE);
        assert!(!sum.is_profiled());

        let sum = ExecCount::new(10).saturating_add(ExecCount::new(5));
        assert_eq!(sum.known(), Some(15));
    }

    #[test]
    fn test_saturating_sub_clamps() {
        assert_eq!(ExecCount::new(5).saturating_sub(10), ExecCount::ZERO);
        assert_eq!(ExecCount::NO_PROFILE.saturating_sub(10), ExecCount::NO_PROFILE);
    }

    #[test]
    fn test_add_assign_promotes_unprofiled() {
        let mut count = ExecCount::NO_PROFILE;
        count += 7;
        assert_eq!(count.known(), Some(7));
    }
}
