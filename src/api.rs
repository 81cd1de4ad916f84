//! The Nanotube API surface (§6.2): the set of intrinsics the passes
//! recognize, along with their calling convention and mod/ref behavior.
//!
//! This is the crate's analogue of the teacher's generated opcode tables
//! (`cranelift-codegen-meta`), but hand-written: the intrinsic set here is
//! small, fixed, and domain-specific rather than machine-generated per
//! target ISA.

use crate::alias::ModRefBehavior;

/// Access kind for a map operation (§3.2, §6.2).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Insert,
    Remove,
    Nop,
}

/// Which operand of a sized access carries the length, and its unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LengthUnit {
    Bytes,
    Bits,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SizedArg {
    /// Index into the call's argument list of the length operand.
    pub arg_index: usize,
    pub unit: LengthUnit,
}

/// A recognized Nanotube API call (§6.2). Variants are grouped by the
/// table in §6.2; packet and map calls are the two domain categories used
/// pervasively by Converge and Mem-to-Req (§3.2), the rest are consumed
/// mostly by Pipeline's setup rewiring (§4.6.6).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    PacketData,
    PacketEnd,
    PacketRead,
    PacketWrite,
    PacketWriteMasked,
    PacketBoundedLength,
    PacketResizeIngress,
    PacketResizeEgress,
    PacketDrop,
    MapLookup,
    MapOp,
    MapOpSend,
    MapOpReceive,
    MapCreate,
    MapRead,
    MapWrite,
    ContextAddMap,
    ChannelCreate,
    ChannelSetAttr,
    ChannelExport,
    ContextAddChannel,
    ThreadCreate,
    ContextCreate,
    TapMapCreate,
    TapMapAddClient,
    TapMapBuild,
}

impl Intrinsic {
    /// Whether this call is a Packet API call (§3.2).
    pub fn is_packet_call(self) -> bool {
        matches!(
            self,
            Intrinsic::PacketData
                | Intrinsic::PacketEnd
                | Intrinsic::PacketRead
                | Intrinsic::PacketWrite
                | Intrinsic::PacketWriteMasked
                | Intrinsic::PacketBoundedLength
                | Intrinsic::PacketResizeIngress
                | Intrinsic::PacketResizeEgress
                | Intrinsic::PacketDrop
        )
    }

    /// Whether this call is a Map API call (§3.2).
    pub fn is_map_call(self) -> bool {
        matches!(
            self,
            Intrinsic::MapLookup
                | Intrinsic::MapOp
                | Intrinsic::MapOpSend
                | Intrinsic::MapOpReceive
                | Intrinsic::MapCreate
                | Intrinsic::MapRead
                | Intrinsic::MapWrite
        )
    }

    /// Is this one of the two intrinsics a two-phase call gets split into
    /// during Pipeline pre-processing (§4.6.1)?
    pub fn is_two_phase(self) -> bool {
        matches!(self, Intrinsic::MapOp)
    }

    /// The API calls that split a pipeline stage (§4.6.4).
    pub fn splits_stage(self) -> bool {
        matches!(
            self,
            Intrinsic::PacketRead
                | Intrinsic::PacketWrite
                | Intrinsic::PacketWriteMasked
                | Intrinsic::PacketResizeIngress
                | Intrinsic::PacketResizeEgress
                | Intrinsic::PacketBoundedLength
                | Intrinsic::MapOpReceive
                | Intrinsic::PacketDrop
        )
    }

    /// Mod/ref behavior for alias analysis and liveness (§6.1).
    pub fn mod_ref_behavior(self) -> ModRefBehavior {
        match self {
            Intrinsic::PacketRead | Intrinsic::MapRead | Intrinsic::MapLookup => {
                ModRefBehavior::READS_ARGS
            }
            Intrinsic::PacketWrite
            | Intrinsic::PacketWriteMasked
            | Intrinsic::MapWrite
            | Intrinsic::PacketResizeIngress
            | Intrinsic::PacketResizeEgress => ModRefBehavior::READS_ARGS | ModRefBehavior::WRITES_ARGS,
            Intrinsic::MapOp | Intrinsic::MapOpSend | Intrinsic::MapOpReceive => {
                ModRefBehavior::READS_ARGS | ModRefBehavior::WRITES_ARGS | ModRefBehavior::WRITES_INACCESSIBLE
            }
            Intrinsic::PacketData
            | Intrinsic::PacketEnd
            | Intrinsic::PacketBoundedLength
            | Intrinsic::PacketDrop => ModRefBehavior::READS_INACCESSIBLE,
            _ => ModRefBehavior::ANYWHERE,
        }
    }

    /// The operand carrying a length, if this call is a sized packet
    /// access (§4.3 Phase B, §4.5).
    pub fn length_arg(self) -> Option<SizedArg> {
        match self {
            Intrinsic::PacketRead | Intrinsic::MapRead => Some(SizedArg {
                arg_index: 2,
                unit: LengthUnit::Bytes,
            }),
            Intrinsic::PacketWrite | Intrinsic::PacketWriteMasked | Intrinsic::MapWrite => {
                Some(SizedArg {
                    arg_index: 2,
                    unit: LengthUnit::Bytes,
                })
            }
            _ => None,
        }
    }
}

/// Access kind of a map API call, when meaningful (§3.2).
pub fn access_kind_of(intrinsic: Intrinsic) -> Option<AccessKind> {
    match intrinsic {
        Intrinsic::MapRead => Some(AccessKind::Read),
        Intrinsic::MapWrite => Some(AccessKind::Write),
        Intrinsic::MapLookup => Some(AccessKind::Read),
        _ => None,
    }
}
