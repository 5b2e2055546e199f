use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers all possible error conditions that can occur while running the post-link
/// optimization pipeline. Most anomalies encountered by individual passes (unanalyzable branch
/// patterns, jump-table predecessors, dynamic branches) are recovered locally by skipping the
/// offending site and never surface here; the variants below are reserved for conditions that
/// abort the pipeline or indicate an internal inconsistency.
///
/// # Error Categories
///
/// ## Pipeline-Aborting Errors
/// - [`Error::CfiFinalization`] - Call-frame information could not be reconciled in strict mode
/// - [`Error::StaleProfile`] - Stale-profile percentage exceeded the configured tolerance
///
/// ## Structural Errors
/// - [`Error::GraphError`] - Control-flow graph invariant violation
/// - [`Error::InvalidBlock`] - A block handle referenced an erased or out-of-range block
///
/// ## Infrastructure Errors
/// - [`Error::LockError`] - Thread synchronization failure
/// - [`Error::IoError`] - Report sink write failure
///
/// # Examples
///
/// ```rust,ignore
/// use reforge::{Error, passes::PassManager};
///
/// match manager.run(&ctx) {
///     Ok(()) => println!("pipeline complete"),
///     Err(Error::CfiFinalization { function }) => {
///         eprintln!("cannot fix CFI state for {function}");
///     }
///     Err(Error::StaleProfile { percent, threshold }) => {
///         eprintln!("{percent:.1}% stale functions exceed {threshold}%");
///     }
///     Err(e) => eprintln!("error: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// Unable to fix the call-frame-information state for a function.
    ///
    /// Raised only when the binary is being rewritten with relocations enabled (strict mode).
    /// In lenient mode the same condition demotes the function to non-optimizable instead.
    ///
    /// # Fields
    ///
    /// * `function` - Name of the function whose CFI state could not be reconciled
    #[error("unable to fix CFI state for function {function}")]
    CfiFinalization {
        /// Name of the offending function
        function: String,
    },

    /// The fraction of functions with stale profile data exceeds the configured tolerance.
    ///
    /// Below the threshold the same condition is reported as a warning only.
    ///
    /// # Fields
    ///
    /// * `percent` - Observed percentage of stale functions among all profiled functions
    /// * `threshold` - Configured maximum tolerated percentage
    #[error("stale functions exceed specified threshold of {threshold}% ({percent:.1}% observed)")]
    StaleProfile {
        /// Observed stale percentage
        percent: f64,
        /// Configured tolerance
        threshold: u32,
    },

    /// A control-flow-graph invariant was violated.
    ///
    /// This indicates an internal inconsistency such as a successor edge without a matching
    /// predecessor entry, or a branch-info list out of sync with the successor list.
    #[error("{0}")]
    GraphError(String),

    /// A block handle referenced an erased or out-of-range basic block.
    ///
    /// The associated value is the raw index of the offending handle.
    #[error("invalid basic block handle {0}")]
    InvalidBlock(usize),

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically when trying to acquire
    /// a mutex that was poisoned by a panicking worker.
    #[error("Failed to lock target")]
    LockError,

    /// Report sink I/O error.
    ///
    /// Wraps standard I/O errors that can occur when writing pass statistics to the
    /// configured output stream.
    #[error("{0}")]
    IoError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories.
    #[error("{0}")]
    Error(String),
}
