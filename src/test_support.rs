//! Scripted toolkit fake and a tempdir-backed coordinator harness.

use crate::config::{DEFAULT_REFERENCE_BUILD, PipelineConfig};
use crate::coordinator::PipelineCoordinator;
use crate::error::PipelineError;
use crate::namespace::ArtifactNamespace;
use crate::progress::{NoProgress, ProgressUpdate};
use crate::records::{MemorySink, RecordSink};
use crate::references::StaticReferences;
use crate::stages::{GenomicToolkit, LineageEvidence, LineageRequest, StageContext};
use anyhow::{Result, bail};
use haplocall_protocol::{
    AlignmentInput, AncestryEstimate, BatchResult, CallableLociSummary, CoverageSummary,
    LineageType, ReadMetrics, Sex, SexCall, SexConfidence, StageId, TechnologyTier,
    VariantCallSummary, VariantSourceKind,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub(crate) const VCF_HEADER: &[u8] = b"##fileformat=VCFv4.2\n";

/// Test-side ends of a stage gate: `entered` fires when the stage starts,
/// and the stage blocks until `release` is sent.
pub(crate) struct StageGate {
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

/// Executor fake that counts invocations per stage.
pub(crate) struct ScriptedToolkit {
    calls: Mutex<BTreeMap<StageId, usize>>,
    failing: Mutex<HashSet<StageId>>,
    panicking: Mutex<HashSet<StageId>>,
    gates: Mutex<HashMap<StageId, (Sender<()>, Receiver<()>)>>,
    sex: SexCall,
    partial_variants: bool,
    seen_read_lengths: Mutex<Vec<Option<u32>>>,
    seen_sex: Mutex<Vec<Option<SexCall>>>,
    lineage_sources: Mutex<Vec<(LineageType, VariantSourceKind)>>,
}

impl ScriptedToolkit {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(HashSet::new()),
            panicking: Mutex::new(HashSet::new()),
            gates: Mutex::new(HashMap::new()),
            sex: SexCall::inferred(Sex::Male, SexConfidence::High),
            partial_variants: false,
            seen_read_lengths: Mutex::new(vec![]),
            seen_sex: Mutex::new(vec![]),
            lineage_sources: Mutex::new(vec![]),
        }
    }

    pub fn failing(self, stage: StageId) -> Self {
        self.set_failing(stage, true);
        self
    }

    /// Panics the first time `stage` runs.
    pub fn panicking(self, stage: StageId) -> Self {
        self.panicking.lock().unwrap().insert(stage);
        self
    }

    /// Variant calling writes part of its output file before it fails.
    pub fn failing_after_partial_variants(mut self) -> Self {
        self.partial_variants = true;
        self.failing(StageId::VariantCalling)
    }

    pub fn with_sex(mut self, sex: SexCall) -> Self {
        self.sex = sex;
        self
    }

    pub fn set_failing(&self, stage: StageId, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(stage);
        } else {
            set.remove(&stage);
        }
    }

    pub fn gate(&self, stage: StageId) -> StageGate {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.gates
            .lock()
            .unwrap()
            .insert(stage, (entered_tx, release_rx));
        StageGate {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn calls(&self, stage: StageId) -> usize {
        self.calls.lock().unwrap().get(&stage).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn seen_read_lengths(&self) -> Vec<Option<u32>> {
        self.seen_read_lengths.lock().unwrap().clone()
    }

    pub fn seen_sex(&self) -> Vec<Option<SexCall>> {
        self.seen_sex.lock().unwrap().clone()
    }

    pub fn lineage_sources(&self) -> Vec<(LineageType, VariantSourceKind)> {
        self.lineage_sources.lock().unwrap().clone()
    }

    fn enter(&self, stage: StageId, ctx: &mut StageContext<'_>) -> Result<()> {
        *self.calls.lock().unwrap().entry(stage).or_default() += 1;
        ctx.report("started", 0, 2);
        let gate = self.gates.lock().unwrap().remove(&stage);
        if let Some((entered, release)) = gate {
            entered.send(()).ok();
            release.recv().ok();
        }
        let panics = self.panicking.lock().unwrap().remove(&stage);
        if panics {
            panic!("{} tool crashed", stage.as_str());
        }
        if self.failing.lock().unwrap().contains(&stage) {
            bail!("{} tool exited with status 1", stage.as_str());
        }
        ctx.report("finishing", 1, 2);
        Ok(())
    }
}

impl GenomicToolkit for ScriptedToolkit {
    fn read_metrics(&self, ctx: &mut StageContext<'_>) -> Result<ReadMetrics> {
        self.enter(StageId::ReadMetrics, ctx)?;
        Ok(ReadMetrics {
            total_reads: 1_000_000,
            mapped_reads: 990_000,
            read_length: 150,
            mean_insert_size: Some(410.0),
        })
    }

    fn coverage(
        &self,
        ctx: &mut StageContext<'_>,
        read_length: Option<u32>,
    ) -> Result<CoverageSummary> {
        self.seen_read_lengths.lock().unwrap().push(read_length);
        self.enter(StageId::Coverage, ctx)?;
        Ok(CoverageSummary {
            mean_depth: 31.5,
            median_depth: 30.0,
            fraction_at_10x: 0.97,
        })
    }

    fn callable_loci(&self, ctx: &mut StageContext<'_>) -> Result<CallableLociSummary> {
        self.enter(StageId::CallableLoci, ctx)?;
        Ok(CallableLociSummary {
            callable_bases: 2_900_000_000,
            total_bases: 3_100_000_000,
            per_contig: BTreeMap::new(),
        })
    }

    fn infer_sex(&self, ctx: &mut StageContext<'_>) -> Result<SexCall> {
        self.enter(StageId::SexInference, ctx)?;
        Ok(self.sex.clone())
    }

    fn call_variants(
        &self,
        ctx: &mut StageContext<'_>,
        sex: Option<&SexCall>,
        output_path: &Path,
    ) -> Result<VariantCallSummary> {
        self.seen_sex.lock().unwrap().push(sex.cloned());
        if self.partial_variants {
            fs::write(output_path, b"##fileformat=VCFv4.2\n#CHROM\tPOS\nchrM\t7")?;
        }
        self.enter(StageId::VariantCalling, ctx)?;
        fs::write(output_path, VCF_HEADER)?;
        Ok(VariantCallSummary {
            vcf_path: output_path.to_path_buf(),
            variant_count: 4_200_000,
        })
    }

    fn lineage(
        &self,
        ctx: &mut StageContext<'_>,
        request: &LineageRequest<'_>,
    ) -> Result<LineageEvidence> {
        self.lineage_sources
            .lock()
            .unwrap()
            .push((request.lineage_type, request.source.source_kind()));
        self.enter(StageId::for_lineage(request.lineage_type), ctx)?;
        let produced_variants = if request.source.is_raw() {
            let path = ctx
                .scratch_dir()
                .join(format!("{}.vcf", request.lineage_type.as_str()));
            fs::write(&path, VCF_HEADER)?;
            Some(path)
        } else {
            None
        };
        Ok(LineageEvidence {
            label: match request.lineage_type {
                LineageType::Paternal => "R1b1a".to_string(),
                LineageType::Maternal => "H1a".to_string(),
            },
            confidence: 0.95,
            supporting_variants: 40,
            conflicting_variants: 1,
            produced_variants,
        })
    }

    fn ancestry(
        &self,
        ctx: &mut StageContext<'_>,
        _variants: Option<&VariantCallSummary>,
    ) -> Result<AncestryEstimate> {
        self.enter(StageId::Ancestry, ctx)?;
        Ok(AncestryEstimate::Estimated(BTreeMap::from([
            ("AFR".to_string(), 0.05),
            ("EUR".to_string(), 0.95),
        ])))
    }
}

/// A coordinator over a fresh temp directory holding one alignment file
/// and one reference FASTA.
pub(crate) struct Harness {
    _td: TempDir,
    pub root: PathBuf,
    pub toolkit: Arc<ScriptedToolkit>,
    pub sink: Arc<MemorySink>,
    pub references: Arc<StaticReferences>,
    pub coordinator: Arc<PipelineCoordinator>,
    pub input: AlignmentInput,
}

impl Harness {
    pub fn new(toolkit: ScriptedToolkit) -> Self {
        Self::with_input(toolkit, |input| input)
    }

    pub fn with_input(
        toolkit: ScriptedToolkit,
        customize: impl FnOnce(AlignmentInput) -> AlignmentInput,
    ) -> Self {
        Self::build(toolkit, true, customize)
    }

    /// No reference build is resolvable.
    pub fn without_reference(toolkit: ScriptedToolkit) -> Self {
        Self::build(toolkit, false, |input| input)
    }

    fn build(
        toolkit: ScriptedToolkit,
        with_reference: bool,
        customize: impl FnOnce(AlignmentInput) -> AlignmentInput,
    ) -> Self {
        let td = tempfile::tempdir().unwrap();
        let root = td.path().to_path_buf();
        let alignment = root.join("a1.bam");
        fs::write(&alignment, b"BAM\x01 first alignment").unwrap();
        let reference = root.join("GRCh38.fa");
        fs::write(&reference, b">chrM\nGATCACAGGTCT\n").unwrap();

        let mut references = StaticReferences::new();
        if with_reference {
            references = references.with_build(DEFAULT_REFERENCE_BUILD, &reference);
        }
        let toolkit = Arc::new(toolkit);
        let sink = Arc::new(MemorySink::new());
        let references = Arc::new(references);
        let config = PipelineConfig::default().with_artifact_root(root.join("artifacts"));
        let coordinator = PipelineCoordinator::new(config, toolkit.clone(), references.clone())
            .unwrap()
            .with_record_sink(sink.clone());
        Self {
            _td: td,
            input: customize(AlignmentInput::new("s1", "r1", "a1", &alignment)),
            root,
            toolkit,
            sink,
            references,
            coordinator: Arc::new(coordinator),
        }
    }

    /// A coordinator as a new process would build it: same artifact root
    /// and toolkit, nothing in memory.
    pub fn restarted_coordinator(&self, sink: Arc<dyn RecordSink>) -> PipelineCoordinator {
        PipelineCoordinator::new(
            self.coordinator.config().clone(),
            self.toolkit.clone(),
            self.references.clone(),
        )
        .unwrap()
        .with_record_sink(sink)
    }

    pub fn run(&self) -> Result<BatchResult, PipelineError> {
        self.coordinator.run(&self.input, &mut NoProgress)
    }

    pub fn run_collecting(&self) -> (Result<BatchResult, PipelineError>, Vec<ProgressUpdate>) {
        let mut updates = Vec::new();
        let result = {
            let mut sink = |update: ProgressUpdate| updates.push(update);
            self.coordinator.run(&self.input, &mut sink)
        };
        (result, updates)
    }

    pub fn namespace(&self) -> ArtifactNamespace {
        self.coordinator.namespace_for(&self.input)
    }

    pub fn replace_alignment(&self, bytes: &[u8]) {
        fs::write(&self.input.alignment_path, bytes).unwrap();
    }

    /// Another alignment of the same run, in its own namespace.
    pub fn second_alignment(&self, alignment_id: &str, bytes: &[u8]) -> AlignmentInput {
        let path = self.root.join(format!("{alignment_id}.bam"));
        fs::write(&path, bytes).unwrap();
        AlignmentInput::new(&self.input.subject_id, &self.input.run_id, alignment_id, path)
    }

    /// An alignment of another sequencing run of the same subject.
    pub fn other_run(&self, run_id: &str, technology: TechnologyTier) -> AlignmentInput {
        let path = self.root.join(format!("{run_id}.bam"));
        fs::write(&path, format!("BAM\x01 {run_id}")).unwrap();
        AlignmentInput::new(&self.input.subject_id, run_id, "a1", path).with_technology(technology)
    }
}
