//! Executor seam between the coordinator and the genomic tools.
//!
//! The coordinator never computes anything genomic itself. Each stage is a
//! blocking call into a [`GenomicToolkit`]; a returned error becomes a soft
//! failure of that stage.

use crate::fallback::Resolution;
use crate::namespace::ArtifactNamespace;
use anyhow::Result;
use haplocall_protocol::{
    AncestryEstimate, CallableLociSummary, CoverageSummary, LineageType, ReadMetrics, SexCall,
    VariantCallSummary,
};
use std::path::{Path, PathBuf};

/// Everything a stage executor may touch while it runs.
pub struct StageContext<'a> {
    pub alignment_path: &'a Path,
    pub reference_path: &'a Path,
    pub namespace: &'a ArtifactNamespace,
    on_progress: &'a mut dyn FnMut(&str, u64, u64),
}

impl<'a> StageContext<'a> {
    pub fn new(
        alignment_path: &'a Path,
        reference_path: &'a Path,
        namespace: &'a ArtifactNamespace,
        on_progress: &'a mut dyn FnMut(&str, u64, u64),
    ) -> Self {
        Self {
            alignment_path,
            reference_path,
            namespace,
            on_progress,
        }
    }

    /// Sub-progress within the running stage; mapped into the stage's share
    /// of the overall range.
    pub fn report(&mut self, message: &str, current: u64, total: u64) {
        (self.on_progress)(message, current, total)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.namespace.scratch_dir()
    }
}

/// What a lineage executor is asked to do.
#[derive(Debug, Clone, Copy)]
pub struct LineageRequest<'a> {
    pub lineage_type: LineageType,
    /// Existing variant file to read, or `ComputeFromRaw`.
    pub source: &'a Resolution,
    /// Where a variant file computed from the raw alignment should end up.
    pub cache_path: &'a Path,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineageEvidence {
    pub label: String,
    pub confidence: f64,
    pub supporting_variants: u32,
    pub conflicting_variants: u32,
    /// Variant file written while computing from the raw alignment, if any.
    pub produced_variants: Option<PathBuf>,
}

pub trait GenomicToolkit: Send + Sync {
    fn read_metrics(&self, ctx: &mut StageContext<'_>) -> Result<ReadMetrics>;

    /// `read_length` is `None` when the read-metrics stage failed.
    fn coverage(
        &self,
        ctx: &mut StageContext<'_>,
        read_length: Option<u32>,
    ) -> Result<CoverageSummary>;

    fn callable_loci(&self, ctx: &mut StageContext<'_>) -> Result<CallableLociSummary>;

    fn infer_sex(&self, ctx: &mut StageContext<'_>) -> Result<SexCall>;

    /// Writes the whole-genome variant file to `output_path`. `sex` selects
    /// sex-chromosome ploidy; `None` means diploid defaults.
    fn call_variants(
        &self,
        ctx: &mut StageContext<'_>,
        sex: Option<&SexCall>,
        output_path: &Path,
    ) -> Result<VariantCallSummary>;

    fn lineage(
        &self,
        ctx: &mut StageContext<'_>,
        request: &LineageRequest<'_>,
    ) -> Result<LineageEvidence>;

    fn ancestry(
        &self,
        _ctx: &mut StageContext<'_>,
        _variants: Option<&VariantCallSummary>,
    ) -> Result<AncestryEstimate> {
        Ok(AncestryEstimate::NotComputed)
    }
}
