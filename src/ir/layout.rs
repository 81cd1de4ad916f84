//! Linear ordering of blocks and instructions (§3.1, §4.0).
//!
//! Grounded on how the teacher's `Layout` is used (via `FuncCursor`) rather
//! than its own source, which the retrieval pack does not carry: a
//! doubly-linked list of blocks, each holding a doubly-linked list of
//! instructions, giving O(1) splice/insert and an O(1) "is A before B in
//! the same block" check via a lazily-assigned sequence number, the way
//! `cranelift_codegen::ir::layout` orders instructions for `dominator_tree`
//! and `flowgraph` to consume.

use crate::ir::entities::{Block, Inst};
use cranelift_entity::SecondaryMap;
use std::collections::HashMap;

#[derive(Default, Clone)]
struct BlockNode {
    prev: Option<Block>,
    next: Option<Block>,
    first_inst: Option<Inst>,
    last_inst: Option<Inst>,
}

#[derive(Default, Clone)]
struct InstNode {
    block: Option<Block>,
    prev: Option<Inst>,
    next: Option<Inst>,
}

/// The program order of blocks and instructions within a function.
#[derive(Default)]
pub struct Layout {
    blocks: SecondaryMap<Block, BlockNode>,
    insts: SecondaryMap<Inst, InstNode>,
    first_block: Option<Block>,
    last_block: Option<Block>,
    block_seq: HashMap<Block, u32>,
    seq_dirty: bool,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_block_inserted(&self, block: Block) -> bool {
        self.blocks[block].prev.is_some() || self.blocks[block].next.is_some() || self.first_block == Some(block)
    }

    pub fn append_block(&mut self, block: Block) {
        debug_assert!(!self.is_block_inserted(block));
        if let Some(last) = self.last_block {
            self.blocks[last].next = Some(block);
            self.blocks[block].prev = Some(last);
        } else {
            self.first_block = Some(block);
        }
        self.last_block = Some(block);
        self.seq_dirty = true;
    }

    /// Inserts `block` immediately after `after` in program order.
    pub fn insert_block_after(&mut self, block: Block, after: Block) {
        debug_assert!(!self.is_block_inserted(block));
        let next = self.blocks[after].next;
        self.blocks[block].prev = Some(after);
        self.blocks[block].next = next;
        self.blocks[after].next = Some(block);
        match next {
            Some(n) => self.blocks[n].prev = Some(block),
            None => self.last_block = Some(block),
        }
        self.seq_dirty = true;
    }

    pub fn blocks(&self) -> BlockIter<'_> {
        BlockIter {
            layout: self,
            next: self.first_block,
        }
    }

    pub fn entry_block(&self) -> Option<Block> {
        self.first_block
    }

    pub fn next_block(&self, block: Block) -> Option<Block> {
        self.blocks[block].next
    }

    pub fn prev_block(&self, block: Block) -> Option<Block> {
        self.blocks[block].prev
    }

    pub fn append_inst(&mut self, inst: Inst, block: Block) {
        debug_assert!(self.insts[inst].block.is_none());
        self.insts[inst].block = Some(block);
        if let Some(last) = self.blocks[block].last_inst {
            self.insts[last].next = Some(inst);
            self.insts[inst].prev = Some(last);
        } else {
            self.blocks[block].first_inst = Some(inst);
        }
        self.blocks[block].last_inst = Some(inst);
    }

    pub fn insert_inst_before(&mut self, inst: Inst, before: Inst) {
        debug_assert!(self.insts[inst].block.is_none());
        let block = self.insts[before].block.expect("before must be inserted");
        let prev = self.insts[before].prev;
        self.insts[inst].block = Some(block);
        self.insts[inst].next = Some(before);
        self.insts[inst].prev = prev;
        self.insts[before].prev = Some(inst);
        match prev {
            Some(p) => self.insts[p].next = Some(inst),
            None => self.blocks[block].first_inst = Some(inst),
        }
    }

    pub fn remove_inst(&mut self, inst: Inst) {
        let node = self.insts[inst].clone();
        let block = node.block.expect("inst not inserted");
        match node.prev {
            Some(p) => self.insts[p].next = node.next,
            None => self.blocks[block].first_inst = node.next,
        }
        match node.next {
            Some(n) => self.insts[n].prev = node.prev,
            None => self.blocks[block].last_inst = node.prev,
        }
        self.insts[inst] = InstNode::default();
    }

    pub fn block_insts(&self, block: Block) -> InstIter<'_> {
        InstIter {
            layout: self,
            next: self.blocks[block].first_inst,
        }
    }

    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.insts[inst].block
    }

    pub fn next_inst(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].next
    }

    /// Splits `block` right before `at`, moving `at` and every later
    /// instruction into a freshly-inserted `new_block` appended
    /// immediately after `block`. Used by Flatten-CFG to materialize
    /// explicit merge blocks and by Pipeline to cut stage boundaries
    /// (§4.5, §4.6.4).
    pub fn split_block(&mut self, block: Block, at: Inst, new_block: Block) {
        debug_assert_eq!(self.insts[at].block, Some(block));
        self.insert_block_after(new_block, block);
        let mut cursor = Some(at);
        let old_last = self.blocks[block].last_inst;
        let before_at = self.insts[at].prev;

        match before_at {
            Some(p) => self.insts[p].next = None,
            None => self.blocks[block].first_inst = None,
        }
        self.blocks[block].last_inst = before_at;

        self.blocks[new_block].first_inst = Some(at);
        self.blocks[new_block].last_inst = old_last;
        self.insts[at].prev = None;

        while let Some(i) = cursor {
            self.insts[i].block = Some(new_block);
            cursor = self.insts[i].next;
        }
        self.seq_dirty = true;
    }

    fn recompute_seq(&mut self) {
        self.block_seq.clear();
        let mut n = 0u32;
        let mut cur = self.first_block;
        while let Some(b) = cur {
            self.block_seq.insert(b, n);
            n += 1;
            cur = self.blocks[b].next;
        }
        self.seq_dirty = false;
    }

    /// Whether `a` precedes `b` in block layout order. Used by Converge's
    /// schedule-legality check to confirm a candidate placement still
    /// respects the existing block order (§4.2).
    pub fn block_precedes(&mut self, a: Block, b: Block) -> bool {
        if self.seq_dirty {
            self.recompute_seq();
        }
        self.block_seq[&a] < self.block_seq[&b]
    }
}

pub struct BlockIter<'a> {
    layout: &'a Layout,
    next: Option<Block>,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = Block;
    fn next(&mut self) -> Option<Block> {
        let block = self.next?;
        self.next = self.layout.blocks[block].next;
        Some(block)
    }
}

pub struct InstIter<'a> {
    layout: &'a Layout,
    next: Option<Inst>,
}

impl<'a> Iterator for InstIter<'a> {
    type Item = Inst;
    fn next(&mut self) -> Option<Inst> {
        let inst = self.next?;
        self.next = self.layout.insts[inst].next;
        Some(inst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn append_and_iterate_blocks() {
        let mut layout = Layout::new();
        let b0 = Block::new(0);
        let b1 = Block::new(1);
        layout.append_block(b0);
        layout.append_block(b1);
        assert_eq!(layout.blocks().collect::<Vec<_>>(), vec![b0, b1]);
        assert!(layout.block_precedes(b0, b1));
        assert!(!layout.block_precedes(b1, b0));
    }

    #[test]
    fn append_and_iterate_insts() {
        let mut layout = Layout::new();
        let b0 = Block::new(0);
        layout.append_block(b0);
        let i0 = Inst::new(0);
        let i1 = Inst::new(1);
        layout.append_inst(i0, b0);
        layout.append_inst(i1, b0);
        assert_eq!(layout.block_insts(b0).collect::<Vec<_>>(), vec![i0, i1]);
    }

    #[test]
    fn split_block_moves_tail_instructions() {
        let mut layout = Layout::new();
        let b0 = Block::new(0);
        let b1 = Block::new(1);
        layout.append_block(b0);
        let i0 = Inst::new(0);
        let i1 = Inst::new(1);
        let i2 = Inst::new(2);
        layout.append_inst(i0, b0);
        layout.append_inst(i1, b0);
        layout.append_inst(i2, b0);
        layout.split_block(b0, i1, b1);
        assert_eq!(layout.block_insts(b0).collect::<Vec<_>>(), vec![i0]);
        assert_eq!(layout.block_insts(b1).collect::<Vec<_>>(), vec![i1, i2]);
        assert_eq!(layout.next_block(b0), Some(b1));
    }
}
