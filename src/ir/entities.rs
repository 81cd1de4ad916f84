//! Opaque entity handles used throughout the IR façade.
//!
//! Passes never hold a live reference into [`crate::ir::function::Function`]
//! across a mutation; instead they carry one of these `u32`-sized newtypes
//! and look values up again through the owning `DataFlowGraph`/`Layout`.
//! This mirrors the teacher's `ir::entities` module and sidesteps the
//! ownership cycles that a doubly-linked, back-referencing IR would
//! otherwise require.

use cranelift_entity::entity_impl;

/// An SSA value: either a block parameter or the result of an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An instruction in a [`crate::ir::function::Function`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// A basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// A stack allocation (`alloca`-equivalent): backing storage for spilled
/// pointer φs, per-call marshalling buffers, and live-state records.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSlot(u32);
entity_impl!(StackSlot, "ss");

/// An opaque handle identifying a map. Two Nanotube map calls that carry
/// the same `MapId` value access the same map (§3.2).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(u32);
entity_impl!(MapId, "map");

/// A basic block denoted by its enclosing block and terminating instruction,
/// used to key CFG predecessor edges (adapted from the teacher's
/// `flowgraph::BlockPredecessor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPredecessor {
    pub block: Block,
    pub inst: Inst,
}

impl BlockPredecessor {
    pub fn new(block: Block, inst: Inst) -> Self {
        Self { block, inst }
    }
}
