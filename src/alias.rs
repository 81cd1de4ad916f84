//! Alias queries over IR memory locations (§3.1, §6.1).
//!
//! Generalizes the teacher's `alias_analysis.rs`, which partitions memory
//! into four hardwired abstract categories (heap/table/vmctx/other) keyed
//! off `MemFlags`, into an open set of disjoint locations keyed by the
//! allocation a pointer provably originates from (a stack slot, the
//! packet argument, or a particular map's key/value storage). The
//! "last store" / "memory values" machinery is the same shape; what
//! changes is how a `Value` is mapped down to its origin.

use crate::ir::entities::{Inst, MapId, StackSlot, Value};
use bitflags::bitflags;
use rustc_hash::FxHashMap;

/// The four-way alias lattice (§3.1, §6.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AliasResult {
    NoAlias,
    MayAlias,
    PartialAlias,
    MustAlias,
}

bitflags! {
    /// Conservative mod/ref summary for a call (§6.1).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ModRefBehavior: u8 {
        const READS_ARGS        = 0b0000_0001;
        const WRITES_ARGS       = 0b0000_0010;
        const READS_INACCESSIBLE  = 0b0000_0100;
        const WRITES_INACCESSIBLE = 0b0000_1000;
        const ANYWHERE = Self::READS_ARGS.bits() | Self::WRITES_ARGS.bits()
            | Self::READS_INACCESSIBLE.bits() | Self::WRITES_INACCESSIBLE.bits();
    }
}

impl ModRefBehavior {
    pub fn reads(self) -> bool {
        self.intersects(ModRefBehavior::READS_ARGS | ModRefBehavior::READS_INACCESSIBLE)
    }

    pub fn writes(self) -> bool {
        self.intersects(ModRefBehavior::WRITES_ARGS | ModRefBehavior::WRITES_INACCESSIBLE)
    }

    /// True if this call can only touch memory reachable from its
    /// arguments (never "inaccessible" memory it wasn't handed a pointer
    /// to). Used by Liveness to scope conservative fallbacks (§4.4).
    pub fn only_args(self) -> bool {
        !self.intersects(ModRefBehavior::READS_INACCESSIBLE | ModRefBehavior::WRITES_INACCESSIBLE)
    }
}

/// The disjoint allocation a [`MemoryLocation`] is rooted in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Stack(StackSlot),
    /// The kernel's packet argument: all packet_read/write/data/end calls
    /// against the same kernel share this origin.
    Packet,
    /// A given map's key/value storage, addressed indirectly via its
    /// request/response protocol rather than a flat address space; kept
    /// disjoint per map so two different maps never alias.
    Map(MapId),
    /// Could not be resolved to a known allocation; treated as aliasing
    /// everything (§4.4 failure modes: "conservative fallback").
    Unknown,
}

/// A memory location: an origin plus a byte range within it (§3.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoryLocation {
    pub origin: Origin,
    pub offset: i64,
    pub size: u32,
}

impl MemoryLocation {
    pub fn new(origin: Origin, offset: i64, size: u32) -> Self {
        Self {
            origin,
            offset,
            size,
        }
    }

    fn end(&self) -> i64 {
        self.offset + i64::from(self.size)
    }

    fn overlaps(&self, other: &MemoryLocation) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Alias queries between [`MemoryLocation`]s and over calls (§6.1).
///
/// Unlike the teacher's `AliasAnalysis`, which fuses alias queries with an
/// in-place load/store forwarding rewrite, this façade only answers
/// queries; Liveness and Mem-to-Req drive their own rewrites using the
/// answers.
#[derive(Default)]
pub struct AliasAnalysis {
    /// Best-effort call summaries keyed by instruction, populated by
    /// passes that know more about a particular call than the static
    /// `Intrinsic` table does (e.g. after Mem-to-Req resolves a call's
    /// buffer argument to a concrete stack slot).
    call_overrides: FxHashMap<Inst, ModRefBehavior>,
}

impl AliasAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_call_behavior(&mut self, inst: Inst, behavior: ModRefBehavior) {
        self.call_overrides.insert(inst, behavior);
    }

    pub fn call_behavior(&self, inst: Inst, default: ModRefBehavior) -> ModRefBehavior {
        self.call_overrides.get(&inst).copied().unwrap_or(default)
    }

    /// Alias relationship between two memory locations (§6.1 `alias`).
    pub fn alias(&self, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult {
        match (a.origin, b.origin) {
            (Origin::Unknown, _) | (_, Origin::Unknown) => AliasResult::MayAlias,
            _ if a.origin != b.origin => AliasResult::NoAlias,
            _ => {
                if !a.overlaps(b) {
                    AliasResult::NoAlias
                } else if a.offset == b.offset && a.size == b.size {
                    AliasResult::MustAlias
                } else {
                    AliasResult::PartialAlias
                }
            }
        }
    }

    /// `modRef(call, loc)` (§6.1): whether a call with the given behavior
    /// can read or write the given location. A call whose behavior is not
    /// scoped to arguments is treated as touching every location
    /// (conservative fallback, §4.4/§7).
    pub fn mod_ref(&self, behavior: ModRefBehavior, _loc: &MemoryLocation) -> ModRefBehavior {
        behavior
    }
}
