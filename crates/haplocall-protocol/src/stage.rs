use crate::lineage::LineageType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// The fixed pipeline sequence. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    ReadMetrics,
    Coverage,
    CallableLoci,
    SexInference,
    VariantCalling,
    MtLineage,
    PaternalLineage,
    Ancestry,
}

impl StageId {
    pub const ALL: [StageId; 8] = [
        StageId::ReadMetrics,
        StageId::Coverage,
        StageId::CallableLoci,
        StageId::SexInference,
        StageId::VariantCalling,
        StageId::MtLineage,
        StageId::PaternalLineage,
        StageId::Ancestry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadMetrics => "read_metrics",
            Self::Coverage => "coverage",
            Self::CallableLoci => "callable_loci",
            Self::SexInference => "sex_inference",
            Self::VariantCalling => "variant_calling",
            Self::MtLineage => "mt_lineage",
            Self::PaternalLineage => "paternal_lineage",
            Self::Ancestry => "ancestry",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::ReadMetrics => "Read metrics",
            Self::Coverage => "Coverage depth",
            Self::CallableLoci => "Callable loci",
            Self::SexInference => "Sex inference",
            Self::VariantCalling => "Variant calling",
            Self::MtLineage => "Maternal lineage",
            Self::PaternalLineage => "Paternal lineage",
            Self::Ancestry => "Ancestry",
        }
    }

    /// 1-based position in the pipeline.
    pub fn ordinal(self) -> usize {
        Self::ALL
            .iter()
            .position(|s| *s == self)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    pub fn lineage_type(self) -> Option<LineageType> {
        match self {
            Self::MtLineage => Some(LineageType::Maternal),
            Self::PaternalLineage => Some(LineageType::Paternal),
            _ => None,
        }
    }

    pub fn for_lineage(lineage_type: LineageType) -> Self {
        match lineage_type {
            LineageType::Maternal => Self::MtLineage,
            LineageType::Paternal => Self::PaternalLineage,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadMetrics {
    pub total_reads: u64,
    pub mapped_reads: u64,
    /// Estimated read length, carried forward into the coverage stage.
    pub read_length: u32,
    #[serde(default)]
    pub mean_insert_size: Option<f64>,
}

impl ReadMetrics {
    pub fn mapped_fraction(&self) -> f64 {
        if self.total_reads == 0 {
            0.0
        } else {
            self.mapped_reads as f64 / self.total_reads as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub mean_depth: f64,
    pub median_depth: f64,
    pub fraction_at_10x: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableLociSummary {
    pub callable_bases: u64,
    pub total_bases: u64,
    #[serde(default)]
    pub per_contig: BTreeMap<String, u64>,
}

impl CallableLociSummary {
    pub fn callable_fraction(&self) -> f64 {
        if self.total_bases == 0 {
            0.0
        } else {
            self.callable_bases as f64 / self.total_bases as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SexConfidence {
    High,
    Low,
}

/// Where a sex call came from. Control flow branches on this, never on display text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SexProvenance {
    Inferred { confidence: SexConfidence },
    UserProvided,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SexCall {
    pub sex: Sex,
    pub provenance: SexProvenance,
    #[serde(default)]
    pub x_autosome_ratio: Option<f64>,
    #[serde(default)]
    pub y_autosome_ratio: Option<f64>,
}

impl SexCall {
    pub fn inferred(sex: Sex, confidence: SexConfidence) -> Self {
        Self {
            sex,
            provenance: SexProvenance::Inferred { confidence },
            x_autosome_ratio: None,
            y_autosome_ratio: None,
        }
    }

    pub fn user_provided(sex: Sex) -> Self {
        Self {
            sex,
            provenance: SexProvenance::UserProvided,
            x_autosome_ratio: None,
            y_autosome_ratio: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            sex: Sex::Unknown,
            provenance: SexProvenance::Failed,
            x_autosome_ratio: None,
            y_autosome_ratio: None,
        }
    }

    /// Only a confident female call rules out a paternal lineage. Male,
    /// unknown, low-confidence and failed calls all keep the paternal stage.
    pub fn is_confident_female(&self) -> bool {
        self.sex == Sex::Female
            && matches!(
                self.provenance,
                SexProvenance::UserProvided
                    | SexProvenance::Inferred {
                        confidence: SexConfidence::High
                    }
            )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantCallSummary {
    pub vcf_path: PathBuf,
    pub variant_count: u64,
}

/// Which input a lineage call was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantSourceKind {
    VendorAlignment,
    VendorRun,
    CachedPipeline,
    CachedLineage,
    RawAlignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageCallOutput {
    pub lineage_type: LineageType,
    pub label: String,
    pub confidence: f64,
    pub supporting_variants: u32,
    pub conflicting_variants: u32,
    pub variant_source: VariantSourceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "components")]
pub enum AncestryEstimate {
    NotComputed,
    Estimated(BTreeMap<String, f64>),
}

/// Cached form of a stage's output as written to the artifact namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "output")]
pub enum StageOutput {
    ReadMetrics(ReadMetrics),
    Coverage(CoverageSummary),
    CallableLoci(CallableLociSummary),
    SexInference(SexCall),
    VariantCalling(VariantCallSummary),
    MtLineage(LineageCallOutput),
    PaternalLineage(LineageCallOutput),
    Ancestry(AncestryEstimate),
}

impl StageOutput {
    pub fn stage(&self) -> StageId {
        match self {
            Self::ReadMetrics(_) => StageId::ReadMetrics,
            Self::Coverage(_) => StageId::Coverage,
            Self::CallableLoci(_) => StageId::CallableLoci,
            Self::SexInference(_) => StageId::SexInference,
            Self::VariantCalling(_) => StageId::VariantCalling,
            Self::MtLineage(_) => StageId::MtLineage,
            Self::PaternalLineage(_) => StageId::PaternalLineage,
            Self::Ancestry(_) => StageId::Ancestry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SkipReason {
    /// Paternal lineage does not apply to a confidently female subject.
    FemaleSubject { user_provided: bool },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FemaleSubject {
                user_provided: true,
            } => f.write_str("subject is female (user-provided)"),
            Self::FemaleSubject {
                user_provided: false,
            } => f.write_str("subject is female (inferred with high confidence)"),
        }
    }
}

/// How a stage left the checkpoint. All three count as done for resumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum StageDisposition {
    Completed,
    SoftFailed { reason: String },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: StageId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSkip {
    pub stage: StageId,
    pub reason: SkipReason,
}
