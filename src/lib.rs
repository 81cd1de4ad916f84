//! A lowering engine for Nanotube packet kernels: takes one whole-packet
//! kernel function and runs it through the fixed pipeline of passes that
//! turn it into a set of straight-line stage functions plus the channel
//! wiring needed to run those stages as a pipeline of cooperating
//! threads (§1, §2).
//!
//! Laid out the way the teacher's `cranelift-codegen` splits a backend
//! into `ir` (the IR façade every pass operates on), a handful of
//! analysis modules (`flowgraph`, `dominator_tree`, `alias`,
//! `memory_ssa`), and the passes themselves — except this crate's
//! "passes" are a fixed, ordered sequence of five lowering stages rather
//! than a target-selected instruction-selection/regalloc pipeline.

pub mod alias;
pub mod api;
pub mod bus;
pub mod config;
pub mod diagnostics;
pub mod dominator_tree;
pub mod flowgraph;
pub mod ir;
pub mod memory_ssa;
pub mod passes;
pub mod setup;
pub mod traversal;

use config::PipelineConfig;
use diagnostics::PassResult;
use ir::function::Function;
use setup::{Setup, SplitStage};

/// Runs the full lowering pipeline over one kernel function: Converge,
/// Mem-to-Req, Liveness, Flatten-CFG, then Pipeline (§4.2–§4.6, in that
/// order). Liveness's own results aren't threaded any further out of
/// this entry point — Flatten-CFG and Pipeline each recompute whatever
/// liveness-shaped information they need internally, the same way the
/// individual pass modules are designed to be run standalone in tests.
pub fn lower(func: &mut Function, config: &PipelineConfig) -> PassResult<(Vec<SplitStage>, Setup)> {
    passes::converge::run(func, config)?;
    passes::mem_to_req::run(func, config)?;
    let cfg = flowgraph::ControlFlowGraph::with_function(func);
    let aliases = alias::AliasAnalysis::new();
    let _liveness = passes::liveness::memory_liveness(func, &cfg, &aliases);
    passes::flatten_cfg::run(func, config)?;
    passes::pipeline::run(func, config)
}
