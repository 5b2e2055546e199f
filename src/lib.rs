// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]

//! # reforge
//!
//! A high-performance framework for profile-guided post-link optimization of compiled
//! binaries. `reforge` takes an already-disassembled machine-function CFG together with
//! execution-profile data and rewrites it - removing dead blocks, reordering code for branch
//! prediction and instruction-cache locality, simplifying conditional tail calls and applying
//! a family of peephole rewrites - while preserving exception-handling metadata, call-frame
//! information and jump-table integrity.
//!
//! ## Features
//!
//! - **📊 Profile-guided layout** - Exact small-function solver plus clustering heuristics
//!   and extended-TSP scoring for large functions
//! - **⚡ Parallel pass pipeline** - Per-function work distributed across worker threads with
//!   cost-aware scheduling
//! - **🔧 Target-agnostic core** - All instruction knowledge behind a semantics oracle; the
//!   x86-64 layer ships in-tree
//! - **🛡️ Safe structural edits** - Deferred block removal, branch repair and CFG validation
//!   after every structural pass
//! - **📦 No emission entanglement** - Lightweight size estimation independent of final
//!   emission, with explicit cleanup of speculative emitter state
//!
//! ## Quick Start
//!
//! ```rust
//! use reforge::{
//!     binary::BinaryContext,
//!     config::{LayoutMode, OptConfig},
//!     isa::X64,
//!     passes::PassManager,
//! };
//!
//! let config = OptConfig {
//!     layout: LayoutMode::ExtTsp,
//!     ..OptConfig::default()
//! };
//! let ctx = BinaryContext::new(Box::new(X64::new()), config);
//!
//! // ... populate ctx with functions, sections and profile data ...
//!
//! let manager = PassManager::standard(&ctx.opts);
//! manager.run(&ctx)?;
//! # Ok::<(), reforge::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `reforge` is organized into several key modules:
//!
//! - [`cfg`] - The per-function data model: blocks, instructions, layout, profile counts
//! - [`binary`] - Process-wide state: function registry, symbols, sections, size estimation
//! - [`isa`] - The instruction-semantics oracle and the x86-64 implementation
//! - [`passes`] - The optimization passes and their scheduling harness
//! - [`dynostats`] - Execution-weighted statistics for ranking and reporting
//! - [`Error`] and [`Result`] - Comprehensive error handling
//!
//! The pipeline runs each pass in sequence over the whole function set; within a pass,
//! per-function work is distributed across a worker pool. Most per-function mutations are
//! independent; global counters aggregate under atomics or a single lock and are reported
//! once per pass.

/// Per-function control-flow-graph data model.
///
/// The types every pass manipulates:
///
/// - [`cfg::BinaryFunction`] - A block arena plus layout, flags and unwind state
/// - [`cfg::BasicBlock`] - Instruction sequence with profiled predecessor/successor edges
/// - [`cfg::Instruction`] - Opaque machine instruction with sparse annotations
/// - [`cfg::FunctionLayout`] - Emission order, fragments and edit distance
/// - [`cfg::ExecCount`] - Profile counts with an explicit no-profile sentinel
pub mod cfg;

/// Process-wide binary state and services.
///
/// - [`binary::BinaryContext`] - The function repository passes run against
/// - [`binary::SymbolTable`] - Interned symbols with speculative-emission dirty tracking
/// - [`binary::SectionTable`] - Read-only section contents and relocations
/// - [`binary::SizeEstimator`] - Code-size estimation independent of final emission
pub mod binary;

/// Pipeline configuration: layout modes, peephole flags, thresholds.
pub mod config;

/// Execution-weighted dynamic statistics ("dyno stats").
pub mod dynostats;

/// Architecture-specific instruction semantics.
///
/// Passes never inspect instructions directly; the [`isa::InstructionSemantics`] oracle
/// answers classification queries and performs rewrites. [`isa::X64`] is the in-tree
/// x86-64 implementation.
pub mod isa;

/// Optimization passes and the parallel scheduling harness.
///
/// See [`passes::PassManager`] for the standard pipeline and [`passes::BinaryPass`] for the
/// interface all passes implement.
pub mod passes;

/// Ordered text reporting for pass statistics.
pub mod report;

mod error;

#[cfg(test)]
pub(crate) mod test;

/// `reforge` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always
/// [`Error`]. This is used consistently throughout the crate for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `reforge` Error type
///
/// The main error type for all operations in this crate. Only pipeline-aborting conditions
/// surface here; per-site anomalies are recovered by skipping the site.
pub use error::Error;

/// Convenient re-exports of commonly used types.
///
/// # Example
///
/// ```rust
/// use reforge::prelude::*;
///
/// let config = OptConfig::default();
/// let ctx = BinaryContext::new(Box::new(X64::new()), config);
/// assert_eq!(ctx.function_count(), 0);
/// ```
pub mod prelude {
    pub use crate::{
        binary::{BinaryContext, BinarySection, FunctionId, SizeEstimator, SymbolId, SymbolTable},
        cfg::{
            AnnotationKind, BasicBlock, BinaryFunction, BlockId, BranchInfo, CondCode, ExecCount,
            FunctionLayout, Instruction, MemOperand, Operation,
        },
        config::{LayoutMode, OptConfig, PeepholeFlags, SctcMode},
        dynostats::{DynoCategory, DynoStats},
        isa::{InstructionSemantics, X64},
        passes::{BinaryPass, PassManager},
        report::ReportSink,
        Error, Result,
    };
}
