//! A function: the unit every pass in the pipeline operates on (§3.1).
//!
//! One Nanotube kernel lowers to one `Function`; Pipeline's stage-split
//! (§4.6) produces several new `Function`s, one per stage, out of a single
//! input `Function`.

use crate::ir::dfg::DataFlowGraph;
use crate::ir::entities::{Block, StackSlot};
use crate::ir::layout::Layout;
use crate::ir::types::Type;
use cranelift_entity::{EntityRef, PrimaryMap};

/// A function's external signature: parameter and return types.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Type>,
    pub returns: Vec<Type>,
}

#[derive(Clone, Debug)]
pub struct StackSlotData {
    pub size: u32,
    pub align_shift: u8,
}

/// A complete function: signature, stack frame, data-flow graph, and the
/// layout ordering its blocks and instructions (§3.1).
pub struct Function {
    pub name: String,
    pub signature: Signature,
    pub dfg: DataFlowGraph,
    pub layout: Layout,
    pub stack_slots: PrimaryMap<StackSlot, StackSlotData>,
    /// Next fresh `Block` index. Blocks have no owning arena of their own
    /// (unlike `Inst`/`Value`, which `DataFlowGraph` allocates via
    /// `PrimaryMap::push`); `Layout`/`DataFlowGraph`'s `SecondaryMap`s grow
    /// lazily the first time a block handle is touched.
    next_block: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: name.into(),
            signature,
            dfg: DataFlowGraph::new(),
            layout: Layout::new(),
            stack_slots: PrimaryMap::new(),
            next_block: 0,
        }
    }

    pub fn create_stack_slot(&mut self, size: u32, align_shift: u8) -> StackSlot {
        self.stack_slots.push(StackSlotData { size, align_shift })
    }

    pub fn create_block(&mut self) -> Block {
        let block = Block::new(self.next_block as usize);
        self.next_block += 1;
        block
    }

    /// Number of blocks created so far; `Block::new(block_count())` is
    /// guaranteed distinct from every block this function has handed out.
    /// [`crate::dominator_tree::PostDominatorTree`] uses this to mint a
    /// synthetic exit block index that can't collide with a real one.
    pub fn block_count(&self) -> u32 {
        self.next_block
    }
}
