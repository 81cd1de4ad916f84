//! Dominator and post-dominator trees, computed via Keith D. Cooper's
//! "simple, fast" iterative algorithm, adapted from the teacher's
//! `dominator_tree::DominatorTree`.
//!
//! Unlike the teacher, which represents a block's immediate dominator as
//! the `Inst` that branches to it (so the dominator relation can be
//! queried down to instruction granularity within a shared block), this
//! façade only needs block-granularity dominance (every consumer here —
//! Liveness, Flatten-CFG, Pipeline — reasons about block-level merge
//! points) and keys `idom` directly by `Block`.
//!
//! Recomputed wholesale after every CFG-changing rewrite rather than
//! incrementally patched, since kernel functions are small; `compute` is
//! the single entry point passes call after mutating the CFG.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::entities::Block;
use crate::ir::function::Function;
use cranelift_entity::{EntityRef, SecondaryMap};
use std::cmp::Ordering;

const STRIDE: u32 = 4;
const SEEN: u32 = 1;
const DONE: u32 = 2;

#[derive(Clone, Default)]
struct DomNode {
    rpo_number: u32,
    idom: Option<Block>,
}

/// A dominator tree, computed over an explicit entry block and CFG
/// (§3.1, §4.4, §4.5, §4.6).
#[derive(Default)]
pub struct DominatorTree {
    nodes: SecondaryMap<Block, DomNode>,
    postorder: Vec<Block>,
    stack: Vec<Block>,
    valid: bool,
}

impl DominatorTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut tree = Self::new();
        tree.compute(func, cfg);
        tree
    }

    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        match func.layout.entry_block() {
            Some(entry) => self.compute_from(entry, cfg),
            None => self.clear(),
        }
    }

    /// Computes the tree from an explicit entry block, independent of any
    /// particular `Function`'s layout. [`PostDominatorTree`] uses this to
    /// run the same algorithm over a CFG with edges reversed and a
    /// synthetic entry standing in for "the unified exit".
    pub fn compute_from(&mut self, entry: Block, cfg: &ControlFlowGraph) {
        debug_assert!(cfg.is_valid());
        self.compute_postorder(entry, cfg);
        self.compute_domtree(cfg);
        self.valid = true;
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.postorder.clear();
        self.stack.clear();
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_reachable(&self, block: Block) -> bool {
        self.nodes[block].rpo_number != 0
    }

    pub fn idom(&self, block: Block) -> Option<Block> {
        self.nodes[block].idom
    }

    pub fn cfg_postorder(&self) -> &[Block] {
        debug_assert!(self.is_valid());
        &self.postorder
    }

    fn rpo_cmp(&self, a: Block, b: Block) -> Ordering {
        self.nodes[a].rpo_number.cmp(&self.nodes[b].rpo_number)
    }

    /// Does `a` dominate `b`? A block is considered to dominate itself.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        if a == b {
            return true;
        }
        let mut cur = b;
        loop {
            match self.idom(cur) {
                Some(idom) => {
                    if idom == a {
                        return true;
                    }
                    cur = idom;
                }
                None => return false,
            }
        }
    }

    /// The nearest common dominator of `a` and `b`. Both must be reachable.
    pub fn common_dominator(&self, mut a: Block, mut b: Block) -> Block {
        loop {
            match self.rpo_cmp(a, b) {
                Ordering::Less => {
                    b = self.idom(b).expect("unreachable block passed to common_dominator");
                }
                Ordering::Greater => {
                    a = self.idom(a).expect("unreachable block passed to common_dominator");
                }
                Ordering::Equal => return a,
            }
        }
    }

    fn compute_postorder(&mut self, entry: Block, cfg: &ControlFlowGraph) {
        self.clear();
        self.stack.push(entry);
        self.nodes[entry].rpo_number = SEEN;

        while let Some(block) = self.stack.pop() {
            match self.nodes[block].rpo_number {
                SEEN => {
                    self.nodes[block].rpo_number = DONE;
                    self.stack.push(block);
                    for succ in cfg.succ_iter(block) {
                        if self.nodes[succ].rpo_number == 0 {
                            self.nodes[succ].rpo_number = SEEN;
                            self.stack.push(succ);
                        }
                    }
                }
                DONE => self.postorder.push(block),
                _ => unreachable!(),
            }
        }
    }

    fn compute_domtree(&mut self, cfg: &ControlFlowGraph) {
        let (entry, rest) = match self.postorder.as_slice().split_last() {
            Some((&e, rest)) => (e, rest.to_vec()),
            None => return,
        };
        self.nodes[entry].rpo_number = 2 * STRIDE;
        for (rpo_idx, &block) in rest.iter().rev().enumerate() {
            self.nodes[block].rpo_number = (rpo_idx as u32 + 3) * STRIDE;
        }
        for &block in rest.iter().rev() {
            self.nodes[block].idom = self.compute_idom(block, cfg);
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rest.iter().rev() {
                let idom = self.compute_idom(block, cfg);
                if self.nodes[block].idom != idom {
                    self.nodes[block].idom = idom;
                    changed = true;
                }
            }
        }
    }

    fn compute_idom(&self, block: Block, cfg: &ControlFlowGraph) -> Option<Block> {
        let mut preds = cfg
            .pred_iter(block)
            .map(|p| p.block)
            .filter(|&pred| self.nodes[pred].rpo_number > 0);
        let mut idom = preds.next()?;
        for pred in preds {
            idom = self.intersect(idom, pred);
        }
        Some(idom)
    }

    fn intersect(&self, mut a: Block, mut b: Block) -> Block {
        loop {
            match self.rpo_cmp(a, b) {
                Ordering::Less => {
                    b = match self.idom(b) {
                        Some(i) => i,
                        None => return a,
                    }
                }
                Ordering::Greater => {
                    a = match self.idom(a) {
                        Some(i) => i,
                        None => return b,
                    }
                }
                Ordering::Equal => return a,
            }
        }
    }
}

/// A post-dominator tree: the ordinary dominator algorithm run over a CFG
/// with every edge reversed and a synthetic node joining every exit block,
/// the standard reduction from post-dominance to dominance. Liveness's
/// backward consumer walk uses this to recognize "every path from this
/// def reaches a use before any redefinition" (§4.4).
#[derive(Default)]
pub struct PostDominatorTree {
    inner: DominatorTree,
    synthetic_exit: Option<Block>,
}

impl PostDominatorTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut tree = Self::new();
        tree.compute(func, cfg);
        tree
    }

    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        let synthetic_exit = Block::new(func.block_count() as usize);
        self.synthetic_exit = Some(synthetic_exit);
        let mut reversed = ControlFlowGraph::new();
        for block in func.layout.blocks() {
            for succ in cfg.succ_iter(block) {
                reversed.add_raw_edge(succ, block);
            }
            if cfg.succ_count(block) == 0 {
                reversed.add_raw_edge(synthetic_exit, block);
            }
        }
        reversed.mark_valid();
        self.inner.compute_from(synthetic_exit, &reversed);
    }

    pub fn idom(&self, block: Block) -> Option<Block> {
        self.inner.idom(block).filter(|&b| Some(b) != self.synthetic_exit)
    }

    pub fn dominates(&self, a: Block, b: Block) -> bool {
        self.inner.dominates(a, b)
    }

    pub fn is_reachable(&self, block: Block) -> bool {
        self.inner.is_reachable(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::Signature;
    use crate::ir::instructions::{BlockCall, InstructionData};
    use smallvec::SmallVec;

    fn diamond() -> (Function, ControlFlowGraph) {
        let mut func = Function::new("k", Signature::default());
        let entry = func.create_block();
        let left = func.create_block();
        let right = func.create_block();
        let join = func.create_block();
        for b in [entry, left, right, join] {
            func.layout.append_block(b);
        }
        let cond = func
            .dfg
            .append_block_param(entry, crate::ir::types::Type::Bool);
        let br = func.dfg.make_inst(InstructionData::Branch {
            condition: cond,
            then_block: BlockCall::new(left, []),
            else_block: BlockCall::new(right, []),
        });
        func.layout.append_inst(br, entry);
        let jl = func.dfg.make_inst(InstructionData::Jump {
            destination: BlockCall::new(join, []),
        });
        func.layout.append_inst(jl, left);
        let jr = func.dfg.make_inst(InstructionData::Jump {
            destination: BlockCall::new(join, []),
        });
        func.layout.append_inst(jr, right);
        let ret = func.dfg.make_inst(InstructionData::Return {
            args: SmallVec::new(),
        });
        func.layout.append_inst(ret, join);
        let cfg = ControlFlowGraph::with_function(&func);
        (func, cfg)
    }

    #[test]
    fn diamond_dominance() {
        let (func, cfg) = diamond();
        let tree = DominatorTree::with_function(&func, &cfg);
        let mut blocks = func.layout.blocks();
        let entry = blocks.next().unwrap();
        let left = blocks.next().unwrap();
        let right = blocks.next().unwrap();
        let join = blocks.next().unwrap();
        assert_eq!(tree.idom(left), Some(entry));
        assert_eq!(tree.idom(right), Some(entry));
        assert_eq!(tree.idom(join), Some(entry));
        assert!(tree.dominates(entry, join));
        assert!(!tree.dominates(left, right));
        assert_eq!(tree.common_dominator(left, right), entry);
    }

    #[test]
    fn diamond_post_dominance() {
        let (func, cfg) = diamond();
        let mut blocks = func.layout.blocks();
        let entry = blocks.next().unwrap();
        let left = blocks.next().unwrap();
        let right = blocks.next().unwrap();
        let join = blocks.next().unwrap();
        let pdt = PostDominatorTree::with_function(&func, &cfg);
        assert_eq!(pdt.idom(left), Some(join));
        assert_eq!(pdt.idom(right), Some(join));
        assert_eq!(pdt.idom(entry), Some(join));
        assert!(pdt.dominates(join, entry));
    }
}
