//! Picks which existing variant file a lineage stage should read.
//!
//! Candidates are evaluated strictly in order; the first one whose file
//! exists and is non-empty wins. Lineage stages use:
//!
//! 1. vendor file attached to the alignment
//! 2. vendor file attached to the sequencing run
//! 3. the pipeline's own whole-genome variant file
//! 4. the per-lineage file cached by an earlier lineage invocation
//! 5. nothing: compute from the raw alignment, then cache the result as (4)

use crate::namespace::{ArtifactNamespace, copy_atomic, is_non_empty_file};
use haplocall_protocol::{AlignmentInput, LineageType, VariantSourceKind, VendorLevel};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateArtifact {
    pub source: VariantSourceKind,
    pub location: PathBuf,
}

impl CandidateArtifact {
    pub fn new(source: VariantSourceKind, location: impl Into<PathBuf>) -> Self {
        Self {
            source,
            location: location.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        is_non_empty_file(&self.location)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Use(CandidateArtifact),
    ComputeFromRaw,
}

impl Resolution {
    pub fn source_kind(&self) -> VariantSourceKind {
        match self {
            Self::Use(candidate) => candidate.source,
            Self::ComputeFromRaw => VariantSourceKind::RawAlignment,
        }
    }

    pub fn location(&self) -> Option<&Path> {
        match self {
            Self::Use(candidate) => Some(candidate.location.as_path()),
            Self::ComputeFromRaw => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::ComputeFromRaw)
    }
}

/// First available candidate, in list order.
pub fn resolve(candidates: &[CandidateArtifact]) -> Option<&CandidateArtifact> {
    candidates.iter().find(|c| c.is_available())
}

/// The ordered candidate list a lineage stage consults.
pub fn lineage_candidates(
    input: &AlignmentInput,
    namespace: &ArtifactNamespace,
    lineage_type: LineageType,
) -> Vec<CandidateArtifact> {
    let mut candidates = Vec::new();
    for (level, source) in [
        (VendorLevel::Alignment, VariantSourceKind::VendorAlignment),
        (VendorLevel::Run, VariantSourceKind::VendorRun),
    ] {
        candidates.extend(
            input
                .vendor_files_for(level, lineage_type)
                .into_iter()
                .map(|path| CandidateArtifact::new(source, path)),
        );
    }
    candidates.push(CandidateArtifact::new(
        VariantSourceKind::CachedPipeline,
        namespace.pipeline_variants_path(),
    ));
    candidates.push(CandidateArtifact::new(
        VariantSourceKind::CachedLineage,
        namespace.lineage_variants_path(lineage_type),
    ));
    candidates
}

pub fn resolve_lineage_source(
    input: &AlignmentInput,
    namespace: &ArtifactNamespace,
    lineage_type: LineageType,
) -> Resolution {
    let candidates = lineage_candidates(input, namespace, lineage_type);
    match resolve(&candidates) {
        Some(candidate) => {
            debug!(
                %lineage_type,
                source = ?candidate.source,
                path = %candidate.location.display(),
                "reusing existing variant file"
            );
            Resolution::Use(candidate.clone())
        }
        None => {
            debug!(%lineage_type, "no reusable variant file; computing from alignment");
            Resolution::ComputeFromRaw
        }
    }
}

/// Stores a freshly computed per-lineage variant file in the namespace cache
/// so later invocations resolve to it. Returns the cache location when a file
/// is present there afterwards.
pub fn write_back(
    namespace: &ArtifactNamespace,
    lineage_type: LineageType,
    produced: Option<&Path>,
) -> io::Result<Option<PathBuf>> {
    let cache = namespace.lineage_variants_path(lineage_type);
    match produced {
        Some(path) if path == cache => {}
        Some(path) if is_non_empty_file(path) => copy_atomic(path, &cache)?,
        _ => {}
    }
    Ok(is_non_empty_file(&cache).then_some(cache))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    struct Fixture {
        _td: tempfile::TempDir,
        root: PathBuf,
        namespace: ArtifactNamespace,
    }

    fn fixture() -> Fixture {
        let td = tempdir().unwrap();
        let root = td.path().to_path_buf();
        let namespace = ArtifactNamespace::at(root.join("ns"));
        namespace.ensure().unwrap();
        Fixture {
            _td: td,
            root,
            namespace,
        }
    }

    fn input_with_vendor(root: &Path) -> AlignmentInput {
        AlignmentInput::new("s1", "r1", "a1", root.join("a1.bam"))
            .with_vendor_file(VendorLevel::Alignment, None, root.join("vendor_aln.vcf.gz"))
            .with_vendor_file(VendorLevel::Run, None, root.join("vendor_run.vcf.gz"))
    }

    #[test]
    fn test_vendor_wins_over_cache() {
        let fx = fixture();
        let input = input_with_vendor(&fx.root);
        fs::write(fx.root.join("vendor_aln.vcf.gz"), b"vendor").unwrap();
        fs::write(fx.namespace.pipeline_variants_path(), b"pipeline").unwrap();
        let resolution = resolve_lineage_source(&input, &fx.namespace, LineageType::Paternal);
        assert_eq!(resolution.source_kind(), VariantSourceKind::VendorAlignment);
        assert_eq!(
            resolution.location(),
            Some(fx.root.join("vendor_aln.vcf.gz").as_path())
        );
    }

    #[test]
    fn test_run_level_vendor_file_comes_second() {
        let fx = fixture();
        let input = input_with_vendor(&fx.root);
        fs::write(fx.root.join("vendor_run.vcf.gz"), b"vendor").unwrap();
        fs::write(fx.namespace.pipeline_variants_path(), b"pipeline").unwrap();
        let resolution = resolve_lineage_source(&input, &fx.namespace, LineageType::Maternal);
        assert_eq!(resolution.source_kind(), VariantSourceKind::VendorRun);
    }

    #[test]
    fn test_cached_pipeline_file_when_no_vendor() {
        let fx = fixture();
        let input = input_with_vendor(&fx.root);
        fs::write(fx.namespace.pipeline_variants_path(), b"pipeline").unwrap();
        fs::write(
            fx.namespace.lineage_variants_path(LineageType::Paternal),
            b"lineage",
        )
        .unwrap();
        let resolution = resolve_lineage_source(&input, &fx.namespace, LineageType::Paternal);
        assert_eq!(resolution.source_kind(), VariantSourceKind::CachedPipeline);
    }

    #[test]
    fn test_empty_files_are_skipped() {
        let fx = fixture();
        let input = input_with_vendor(&fx.root);
        fs::write(fx.root.join("vendor_aln.vcf.gz"), b"").unwrap();
        fs::write(fx.namespace.pipeline_variants_path(), b"").unwrap();
        fs::write(
            fx.namespace.lineage_variants_path(LineageType::Paternal),
            b"lineage",
        )
        .unwrap();
        let resolution = resolve_lineage_source(&input, &fx.namespace, LineageType::Paternal);
        assert_eq!(resolution.source_kind(), VariantSourceKind::CachedLineage);
    }

    #[test]
    fn test_nothing_available_means_raw() {
        let fx = fixture();
        let input = input_with_vendor(&fx.root);
        let resolution = resolve_lineage_source(&input, &fx.namespace, LineageType::Paternal);
        assert!(resolution.is_raw());
        assert_eq!(resolution.location(), None);
    }

    #[test]
    fn test_candidate_order() {
        let fx = fixture();
        let input = input_with_vendor(&fx.root);
        let kinds: Vec<_> = lineage_candidates(&input, &fx.namespace, LineageType::Maternal)
            .into_iter()
            .map(|c| c.source)
            .collect();
        assert_eq!(
            kinds,
            vec![
                VariantSourceKind::VendorAlignment,
                VariantSourceKind::VendorRun,
                VariantSourceKind::CachedPipeline,
                VariantSourceKind::CachedLineage,
            ]
        );
    }

    #[test]
    fn test_write_back_short_circuits_next_resolution() {
        let fx = fixture();
        let input = AlignmentInput::new("s1", "r1", "a1", fx.root.join("a1.bam"));
        let produced = fx.namespace.scratch_dir().join("chrY.vcf.gz");
        fs::write(&produced, b"computed").unwrap();

        let cached = write_back(&fx.namespace, LineageType::Paternal, Some(&produced)).unwrap();
        assert_eq!(
            cached,
            Some(fx.namespace.lineage_variants_path(LineageType::Paternal))
        );
        let resolution = resolve_lineage_source(&input, &fx.namespace, LineageType::Paternal);
        assert_eq!(resolution.source_kind(), VariantSourceKind::CachedLineage);
        let maternal = resolve_lineage_source(&input, &fx.namespace, LineageType::Maternal);
        assert!(maternal.is_raw());
    }

    #[test]
    fn test_write_back_without_output_leaves_cache_empty() {
        let fx = fixture();
        let cached = write_back(&fx.namespace, LineageType::Maternal, None).unwrap();
        assert_eq!(cached, None);
        let missing = fx.root.join("never_written.vcf.gz");
        let cached = write_back(&fx.namespace, LineageType::Maternal, Some(&missing)).unwrap();
        assert_eq!(cached, None);
    }
}
