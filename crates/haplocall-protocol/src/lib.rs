//! Shared machine-readable contracts for the haplocall batch pipeline.
//!
//! Everything in this crate is a plain serde value type. The coordinator,
//! the consensus ledger and any external repository layer exchange these
//! records; none of them perform I/O.

pub mod alignment;
pub mod batch;
pub mod checkpoint;
pub mod lineage;
pub mod metrics;
pub mod stage;

pub use alignment::{
    AlignmentId, AlignmentInput, RunId, SubjectId, TechnologyTier, VendorFile, VendorLevel,
};
pub use batch::{BatchResult, StageOutcome};
pub use checkpoint::{CHECKPOINT_SCHEMA_VERSION, Checkpoint, Fingerprint, StageMark};
pub use lineage::{
    CallConflict, Compatibility, ConsensusCall, LineageType, ReconciliationRecord, RunLineageCall,
};
pub use metrics::{AlignmentMetrics, RunMetrics, SubjectProfile};
pub use stage::{
    AncestryEstimate, CallableLociSummary, CoverageSummary, LineageCallOutput, ReadMetrics, Sex,
    SexCall, SexConfidence, SexProvenance, SkipReason, StageDisposition, StageFailure, StageId,
    StageOutput, StageSkip, VariantCallSummary, VariantSourceKind,
};

pub fn now_unix_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
