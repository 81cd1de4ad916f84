//! The control-flow graph: predecessor and successor adjacency derived
//! from a function's terminators (§3.1, §4.0).
//!
//! Adapted from the teacher's `flowgraph::ControlFlowGraph`, which keys
//! adjacency off `bforest::Map`/`Set` so it can be rebuilt incrementally
//! after small edits to very large functions. Packet kernels are tiny by
//! comparison, so this façade recomputes the whole graph from the layout
//! on every `compute` call and stores adjacency in plain `Vec`s; the
//! public shape (`pred_iter`/`succ_iter`, `BlockPredecessor`) is kept the
//! same so passes read the same way they would against the teacher.

use crate::ir::entities::{Block, BlockPredecessor};
use crate::ir::function::Function;
use cranelift_entity::SecondaryMap;

#[derive(Clone, Default)]
struct CfgNode {
    predecessors: Vec<BlockPredecessor>,
    successors: Vec<Block>,
}

/// The control-flow graph of one function, computed fresh from its
/// layout and instructions (§3.1).
#[derive(Default)]
pub struct ControlFlowGraph {
    data: SecondaryMap<Block, CfgNode>,
    valid: bool,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    /// Recomputes predecessor/successor adjacency from scratch (§3.1
    /// "successors/predecessors" derived strictly from terminators).
    pub fn compute(&mut self, func: &Function) {
        self.data.clear();
        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                let data = func.dfg.inst_data(inst);
                for call in data.branch_destinations() {
                    self.data[block].successors.push(call.block);
                    self.data[call.block]
                        .predecessors
                        .push(BlockPredecessor::new(block, inst));
                }
            }
        }
        self.valid = true;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn pred_iter(&self, block: Block) -> impl Iterator<Item = BlockPredecessor> + '_ {
        self.data[block].predecessors.iter().copied()
    }

    pub fn succ_iter(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.data[block].successors.iter().copied()
    }

    pub fn pred_count(&self, block: Block) -> usize {
        self.data[block].predecessors.len()
    }

    pub fn succ_count(&self, block: Block) -> usize {
        self.data[block].successors.len()
    }

    /// Adds a single edge without deriving it from any `Function`. Used
    /// to build the reversed graph [`crate::dominator_tree::PostDominatorTree`]
    /// runs the ordinary dominator algorithm over; the predecessor's
    /// instruction is not meaningful for that edge; any unreachable
    /// block serves as a placeholder because no consumer reads it for a
    /// synthetic edge.
    pub(crate) fn add_raw_edge(&mut self, from: Block, to: Block) {
        use crate::ir::entities::{BlockPredecessor, Inst};
        use cranelift_entity::EntityRef;
        self.data[from].successors.push(to);
        self.data[to]
            .predecessors
            .push(BlockPredecessor::new(from, Inst::new(0)));
    }

    pub(crate) fn mark_valid(&mut self) {
        self.valid = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::Signature;
    use crate::ir::instructions::{BlockCall, InstructionData};
    use smallvec::SmallVec;

    #[test]
    fn diamond_cfg_adjacency() {
        let mut func = Function::new("k", Signature::default());
        let entry = func.create_block();
        let left = func.create_block();
        let right = func.create_block();
        let join = func.create_block();
        for b in [entry, left, right, join] {
            func.layout.append_block(b);
        }

        let cond = func.dfg.append_block_param(entry, crate::ir::types::Type::Bool);
        let br = func.dfg.make_inst(InstructionData::Branch {
            condition: cond,
            then_block: BlockCall::new(left, []),
            else_block: BlockCall::new(right, []),
        });
        func.layout.append_inst(br, entry);

        let jl = func
            .dfg
            .make_inst(InstructionData::Jump {
                destination: BlockCall::new(join, []),
            });
        func.layout.append_inst(jl, left);
        let jr = func
            .dfg
            .make_inst(InstructionData::Jump {
                destination: BlockCall::new(join, []),
            });
        func.layout.append_inst(jr, right);

        let ret = func.dfg.make_inst(InstructionData::Return {
            args: SmallVec::new(),
        });
        func.layout.append_inst(ret, join);

        let cfg = ControlFlowGraph::with_function(&func);
        assert_eq!(cfg.succ_count(entry), 2);
        assert_eq!(cfg.pred_count(join), 2);
        assert_eq!(cfg.pred_count(entry), 0);
    }
}
