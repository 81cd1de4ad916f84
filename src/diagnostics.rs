//! Pass failure modes (§7), concretized as a `thiserror`-derived enum.
//!
//! Grounded on error enums across the pack (`wasi-common`'s `Error`,
//! `cranelift-wasm`'s `WasmError`): one variant per named failure mode,
//! each carrying the offending function name and a `Display`-rendered
//! instruction or block so a test or caller can match on the message
//! without reaching into pass-internal state. Fatal conditions propagate
//! as `Result<_, PassError>` out of a pass's entry point; internal-only
//! invariants use `debug_assert!`; recoverable conditions (consistency
//! mismatches, best-effort alias fallback) are logged at `warn!`/`trace!`
//! via the `log` crate and do not abort the pass, exactly as the
//! teacher's `alias_analysis.rs` and `context.rs` do.

use thiserror::Error;

pub type PassResult<T> = Result<T, PassError>;

/// A fatal pass error (§7, §4.2.8, §4.3, §4.4, §4.5, §4.6.7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PassError {
    /// Converge's merge-compatibility check failed mid-plan (§4.2.8):
    /// indicates a planning bug rather than a malformed kernel.
    #[error("{function}: merge-compatibility check failed while planning convergence of `{detail}`")]
    MergeCompatibilityFailed { function: String, detail: String },

    /// Converge encountered a Nanotube API level it does not recognize
    /// (§4.2.8).
    #[error("{function}: unrecognized API level for call `{detail}`")]
    UnrecognizedApiLevel { function: String, detail: String },

    /// Mem-to-Req found a single computation flowing from both a map and
    /// a packet origin (§4.3 failure modes).
    #[error("{function}: value `{detail}` carries both map and packet origin")]
    MixedMapAndPacketOrigin { function: String, detail: String },

    /// Mem-to-Req could not root a load/store's address in a known
    /// packet/map/stack origin (§4.3 failure modes).
    #[error("{function}: `{detail}` accesses memory not rooted in a known origin")]
    UnrootedMemoryAccess { function: String, detail: String },

    /// A GEP's offset did not reduce to constant-plus-variable form
    /// (§4.3 failure modes).
    #[error("{function}: address computation `{detail}` is not reducible to constant-plus-variable")]
    IrreducibleAddressComputation { function: String, detail: String },

    /// Flatten-CFG was asked to move an unsafe-to-speculate call under a
    /// non-true predicate (§4.5 failure modes).
    #[error("{function}: cannot speculate call `{detail}` under a non-true predicate")]
    UnsafeSpeculation { function: String, detail: String },

    /// Flatten-CFG found a store whose address is derived from a
    /// control-dependent allocation that has not yet been hoisted (§4.5
    /// failure modes).
    #[error("{function}: store `{detail}` addresses a not-yet-hoisted control-dependent allocation")]
    UnhoistedControlDependentStore { function: String, detail: String },

    /// Pipeline found more than one Nanotube call scheduled into a
    /// single stage (§4.6.7).
    #[error("{function}: stage `{detail}` would contain more than one Nanotube API call")]
    MultipleCallsPerStage { function: String, detail: String },

    /// A value is live into the first stage or live out of the last
    /// stage (§4.6.7).
    #[error("{function}: `{detail}` is live across the pipeline's outer boundary")]
    LiveAcrossPipelineBoundary { function: String, detail: String },

    /// Pipeline found a consumer of an API call's return value it does
    /// not recognize (§4.6.7).
    #[error("{function}: unrecognized consumer of return value from `{detail}`")]
    UnrecognizedReturnValueConsumer { function: String, detail: String },

    /// A PHI selects between overlapping, simultaneously-live memory
    /// regions; not supported (§4.6.7).
    #[error("{function}: phi `{detail}` selects between overlapping live memory regions")]
    OverlappingLiveMemoryPhi { function: String, detail: String },

    /// The source's ambiguous Memory-SSA walk termination ("XXX"/"FIXME"
    /// in the original, §9 Open Questions): rather than silently guessing
    /// when a clobber walk should stop, this is reported as an error so
    /// the ambiguous case is visible.
    #[error("{function}: memory-SSA clobber walk from `{detail}` did not reach a conclusive answer")]
    AmbiguousMemorySsaWalk { function: String, detail: String },

    /// The source fakes a packet_write success code for return-value
    /// consumers (§9 Open Questions); flagged rather than silently
    /// replicated.
    #[error("{function}: `{detail}` consumes a packet_write return value with no defined success semantics")]
    FakedPacketWriteSuccess { function: String, detail: String },

    /// A long-range constant-or-undef pointer phi with no defined
    /// hoisting policy (§9 Open Questions).
    #[error("{function}: phi `{detail}` mixes a long-range pointer with a constant/undef incoming value")]
    LongRangePointerPhi { function: String, detail: String },

    /// Liveness found a call that reads memory but isn't annotated as
    /// touching only argument or inaccessible memory (§4.4 failure
    /// modes): non-fatal, collected as a warning alongside a conservative
    /// "touches everything" fallback rather than aborting the pass.
    #[error("{function}: call `{detail}` reads memory without a recognized mod/ref annotation")]
    UnannotatedMemoryEffect { function: String, detail: String },
}

impl PassError {
    pub fn function(&self) -> &str {
        match self {
            PassError::MergeCompatibilityFailed { function, .. }
            | PassError::UnrecognizedApiLevel { function, .. }
            | PassError::MixedMapAndPacketOrigin { function, .. }
            | PassError::UnrootedMemoryAccess { function, .. }
            | PassError::IrreducibleAddressComputation { function, .. }
            | PassError::UnsafeSpeculation { function, .. }
            | PassError::UnhoistedControlDependentStore { function, .. }
            | PassError::MultipleCallsPerStage { function, .. }
            | PassError::LiveAcrossPipelineBoundary { function, .. }
            | PassError::UnrecognizedReturnValueConsumer { function, .. }
            | PassError::OverlappingLiveMemoryPhi { function, .. }
            | PassError::AmbiguousMemorySsaWalk { function, .. }
            | PassError::FakedPacketWriteSuccess { function, .. }
            | PassError::LongRangePointerPhi { function, .. }
            | PassError::UnannotatedMemoryEffect { function, .. } => function,
        }
    }
}
