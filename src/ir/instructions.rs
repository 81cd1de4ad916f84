//! Instruction formats for the IR façade (§3.1, §4.0).
//!
//! A single tagged enum rather than the teacher's generated
//! `InstructionData` (whose variants are emitted per-opcode by
//! `cranelift-codegen-meta` from an instruction-set description): the
//! opcode set here is small and fixed, so it is hand-written directly in
//! the teacher's idiom instead of machine-generated.

use crate::api::Intrinsic;
use crate::ir::entities::{Block, StackSlot, Value};
use crate::ir::types::Type;
use smallvec::SmallVec;

/// Arithmetic, comparison, and conversion opcodes (§3.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Iadd,
    Isub,
    Imul,
    Sdiv,
    Udiv,
    Srem,
    Urem,
    Band,
    Bor,
    Bxor,
    Bnot,
    Ishl,
    Sshr,
    Ushr,
    IcmpEq,
    IcmpNe,
    IcmpSlt,
    IcmpSle,
    IcmpSgt,
    IcmpSge,
    IcmpUlt,
    IcmpUle,
    IcmpUgt,
    IcmpUge,
    /// Truncate to a narrower integer type.
    Trunc,
    /// Sign-extend to a wider integer type.
    Sextend,
    /// Zero-extend to a wider integer type.
    Uextend,
    /// Reinterpret bits at the same width (e.g. ptr <-> i64).
    Bitcast,
}

impl Opcode {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::Iadd | Opcode::Imul | Opcode::Band | Opcode::Bor | Opcode::Bxor
        )
    }

    pub fn is_compare(self) -> bool {
        matches!(
            self,
            Opcode::IcmpEq
                | Opcode::IcmpNe
                | Opcode::IcmpSlt
                | Opcode::IcmpSle
                | Opcode::IcmpSgt
                | Opcode::IcmpSge
                | Opcode::IcmpUlt
                | Opcode::IcmpUle
                | Opcode::IcmpUgt
                | Opcode::IcmpUge
        )
    }
}

/// A single case of a [`InstructionData::Switch`]: a scrutinee value to
/// match and the block to jump to when it matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchCase {
    pub value: i64,
    pub block: BlockCall,
}

/// A block reference together with the argument values passed to its
/// parameters along that edge (§3.1, mirrors the teacher's `BlockCall`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCall {
    pub block: Block,
    pub args: SmallVec<[Value; 4]>,
}

impl BlockCall {
    pub fn new(block: Block, args: impl IntoIterator<Item = Value>) -> Self {
        Self {
            block,
            args: args.into_iter().collect(),
        }
    }
}

/// One instruction's opcode-specific payload (§3.1, §4.0).
///
/// Multi-result instructions (`Call`, `NanotubeCall`) record their result
/// count/types separately in [`crate::ir::dfg::DataFlowGraph`]; this enum
/// only carries operands, not results, mirroring the teacher's split
/// between `InstructionData` and `DataFlowGraph::results`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstructionData {
    Binary {
        opcode: Opcode,
        args: [Value; 2],
    },
    Unary {
        opcode: Opcode,
        arg: Value,
        ty: Type,
    },
    IconstU64 {
        value: u64,
    },
    IconstI64 {
        value: i64,
    },
    /// Stack-slot address, offset by a constant (the façade's sole
    /// pointer-arithmetic primitive besides raw integer add: Mem-to-Req
    /// lowers all Packet/Map accesses to byte offsets, so GEPs over
    /// in-kernel aggregates are the only address computation left once
    /// Mem-to-Req has run, §4.3).
    StackAddr {
        slot: StackSlot,
        offset: i32,
    },
    Load {
        ptr: Value,
        offset: i32,
        ty: Type,
    },
    Store {
        ptr: Value,
        offset: i32,
        value: Value,
    },
    /// A direct call to a known Nanotube API intrinsic (§6.2). Kept
    /// distinct from an ordinary `Call` so passes can match on it without
    /// a callee-name lookup, mirroring how the teacher gives library
    /// calls their own opcodes rather than overloading `call`.
    NanotubeCall {
        intrinsic: Intrinsic,
        args: SmallVec<[Value; 4]>,
    },
    /// A call to a kernel-defined helper function, opaque to every pass
    /// except the ones that specifically need to inline or summarize it.
    Call {
        callee: Value,
        args: SmallVec<[Value; 4]>,
    },
    Jump {
        destination: BlockCall,
    },
    Branch {
        condition: Value,
        then_block: BlockCall,
        else_block: BlockCall,
    },
    Switch {
        scrutinee: Value,
        cases: Vec<SwitchCase>,
        default: BlockCall,
    },
    Return {
        args: SmallVec<[Value; 2]>,
    },
    /// An explicit block-parameter phi, used only by passes (Liveness,
    /// Flatten-CFG) that need to reify merges the `DataFlowGraph`'s
    /// implicit block-parameter form leaves out-of-line (§4.4, §4.5).
    Phi {
        incoming: Vec<(Block, Value)>,
    },
    Select {
        condition: Value,
        then_value: Value,
        else_value: Value,
    },
}

impl InstructionData {
    /// The operand values read by this instruction, in order. Block-call
    /// arguments on terminators are included since they are genuine SSA
    /// uses (§3.1).
    pub fn arguments(&self) -> SmallVec<[Value; 4]> {
        match self {
            InstructionData::Binary { args, .. } => args.iter().copied().collect(),
            InstructionData::Unary { arg, .. } => smallvec::smallvec![*arg],
            InstructionData::IconstU64 { .. } | InstructionData::IconstI64 { .. } => {
                SmallVec::new()
            }
            InstructionData::StackAddr { .. } => SmallVec::new(),
            InstructionData::Load { ptr, .. } => smallvec::smallvec![*ptr],
            InstructionData::Store { ptr, value, .. } => smallvec::smallvec![*ptr, *value],
            InstructionData::NanotubeCall { args, .. } => args.clone(),
            InstructionData::Call { callee, args } => {
                let mut v = SmallVec::new();
                v.push(*callee);
                v.extend(args.iter().copied());
                v
            }
            InstructionData::Jump { destination } => destination.args.clone(),
            InstructionData::Branch {
                condition,
                then_block,
                else_block,
            } => {
                let mut v = SmallVec::new();
                v.push(*condition);
                v.extend(then_block.args.iter().copied());
                v.extend(else_block.args.iter().copied());
                v
            }
            InstructionData::Switch {
                scrutinee,
                cases,
                default,
            } => {
                let mut v = SmallVec::new();
                v.push(*scrutinee);
                for case in cases {
                    v.extend(case.block.args.iter().copied());
                }
                v.extend(default.args.iter().copied());
                v
            }
            InstructionData::Return { args } => args.clone(),
            InstructionData::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            InstructionData::Select {
                condition,
                then_value,
                else_value,
            } => smallvec::smallvec![*condition, *then_value, *else_value],
        }
    }

    /// Whether this instruction ends a block (§3.1).
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstructionData::Jump { .. }
                | InstructionData::Branch { .. }
                | InstructionData::Switch { .. }
                | InstructionData::Return { .. }
        )
    }

    /// Outgoing block edges, if this is a terminator (§4.4 CFG successors).
    pub fn branch_destinations(&self) -> SmallVec<[&BlockCall; 2]> {
        match self {
            InstructionData::Jump { destination } => smallvec::smallvec![destination],
            InstructionData::Branch {
                then_block,
                else_block,
                ..
            } => smallvec::smallvec![then_block, else_block],
            InstructionData::Switch { cases, default, .. } => {
                let mut v: SmallVec<[&BlockCall; 2]> = SmallVec::new();
                v.push(default);
                v.extend(cases.iter().map(|case| &case.block));
                v
            }
            _ => SmallVec::new(),
        }
    }

    /// Whether this instruction may read or write memory, independent of
    /// the alias-analysis `ModRefBehavior`, used to scope reordering
    /// during the Converge schedule search (§4.2 Phase B).
    pub fn touches_memory(&self) -> bool {
        matches!(
            self,
            InstructionData::Load { .. }
                | InstructionData::Store { .. }
                | InstructionData::NanotubeCall { .. }
                | InstructionData::Call { .. }
        )
    }
}
