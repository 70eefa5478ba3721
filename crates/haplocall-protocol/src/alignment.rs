use crate::lineage::LineageType;
use crate::stage::Sex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type SubjectId = String;
pub type RunId = String;
pub type AlignmentId = String;

/// Evidence quality of the sequencing technology behind a run.
///
/// Variant order is the consensus ranking: `WholeGenome` outranks
/// `TargetedDeep`, which outranks `Array`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnologyTier {
    Array,
    TargetedDeep,
    WholeGenome,
}

impl TechnologyTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::TargetedDeep => "targeted",
            Self::WholeGenome => "whole_genome",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorLevel {
    Alignment,
    Run,
}

/// A variant file delivered by the sequencing vendor alongside the reads.
///
/// `lineage_type: None` means the file covers the whole genome and is usable
/// for either lineage stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorFile {
    pub level: VendorLevel,
    #[serde(default)]
    pub lineage_type: Option<LineageType>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentInput {
    pub subject_id: SubjectId,
    pub run_id: RunId,
    pub alignment_id: AlignmentId,
    pub alignment_path: PathBuf,
    pub technology: TechnologyTier,
    /// Sex recorded on the subject by the user; short-circuits inference.
    #[serde(default)]
    pub declared_sex: Option<Sex>,
    #[serde(default)]
    pub vendor_files: Vec<VendorFile>,
}

impl AlignmentInput {
    pub fn new(
        subject_id: impl Into<String>,
        run_id: impl Into<String>,
        alignment_id: impl Into<String>,
        alignment_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            run_id: run_id.into(),
            alignment_id: alignment_id.into(),
            alignment_path: alignment_path.into(),
            technology: TechnologyTier::WholeGenome,
            declared_sex: None,
            vendor_files: vec![],
        }
    }

    pub fn with_technology(mut self, technology: TechnologyTier) -> Self {
        self.technology = technology;
        self
    }

    pub fn with_declared_sex(mut self, sex: Sex) -> Self {
        self.declared_sex = Some(sex);
        self
    }

    pub fn with_vendor_file(
        mut self,
        level: VendorLevel,
        lineage_type: Option<LineageType>,
        path: impl Into<PathBuf>,
    ) -> Self {
        self.vendor_files.push(VendorFile {
            level,
            lineage_type,
            path: path.into(),
        });
        self
    }

    /// Vendor files at `level` usable for `lineage_type`, lineage-specific files first.
    pub fn vendor_files_for(&self, level: VendorLevel, lineage_type: LineageType) -> Vec<&Path> {
        let specific = self
            .vendor_files
            .iter()
            .filter(|f| f.level == level && f.lineage_type == Some(lineage_type));
        let generic = self
            .vendor_files
            .iter()
            .filter(|f| f.level == level && f.lineage_type.is_none());
        specific.chain(generic).map(|f| f.path.as_path()).collect()
    }
}
