//! The resumable stage loop.
//!
//! One [`PipelineCoordinator`] serves any number of alignments. Each run
//! owns the artifact namespace of its alignment for its whole duration;
//! a second run on the same namespace is refused until the first returns.

use crate::checkpoint::{CheckpointStore, remove_if_exists};
use crate::config::PipelineConfig;
use crate::consensus::ConsensusEngine;
use crate::error::{CheckpointError, ConfigError, ConsensusInputError, PipelineError};
use crate::fallback;
use crate::fingerprint::fingerprint_file;
use crate::ledger::ReconciliationLedger;
use crate::lineage_tree::{LineageTreeComparator, NomenclatureComparator};
use crate::namespace::{ArtifactNamespace, canonical_or_display};
use crate::progress::{ProgressPlan, ProgressReporter, ProgressSink};
use crate::records::{MemorySink, PipelineRecord, RecordSink};
use crate::references::{ReferenceResolver, resolver_from_config};
use crate::snapshot::{PipelineSnapshot, record_sources};
use crate::stages::{GenomicToolkit, LineageRequest, StageContext};
use crate::task::CancellationToken;
use haplocall_protocol::{
    AlignmentInput, BatchResult, Checkpoint, LineageCallOutput, LineageType,
    ReconciliationRecord, RunLineageCall, SexCall, SexProvenance, SkipReason, StageDisposition,
    StageFailure, StageId, StageMark, StageOutput, StageSkip, VariantCallSummary, now_unix_ms,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, info_span, instrument, warn};

enum StageAttempt {
    Completed(StageOutput),
    SoftFailed(String),
    Skipped(SkipReason),
}

/// Per-run state threaded through the stage loop.
struct RunState {
    checkpoint: Checkpoint,
    snapshot: PipelineSnapshot,
    result: BatchResult,
    reference_path: PathBuf,
    /// Done stages whose cached output could not be read back.
    unrestored: Vec<StageId>,
}

impl RunState {
    fn warn(&mut self, message: String) {
        note_warning(&mut self.result.warnings, message);
    }

    fn absorb(&mut self, output: StageOutput) {
        self.snapshot = self.snapshot.apply(&output);
        self.result.absorb(output);
    }

    /// Scalars later stages read from the checkpoint rather than from the
    /// (possibly failed) stage output of this run.
    fn carry_forward(&mut self, output: &StageOutput) {
        match output {
            StageOutput::ReadMetrics(metrics) => {
                self.checkpoint.read_length_estimate = Some(metrics.read_length)
            }
            StageOutput::SexInference(call) => self.checkpoint.sex = Some(call.clone()),
            _ => {}
        }
    }
}

fn note_warning(warnings: &mut Vec<String>, message: String) {
    warn!("{message}");
    warnings.push(message);
}

/// Releases the namespace when the run returns, panics included.
struct NamespaceClaim<'a> {
    active: &'a Mutex<HashSet<PathBuf>>,
    root: PathBuf,
}

impl Drop for NamespaceClaim<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.root);
    }
}

pub struct PipelineCoordinator {
    config: PipelineConfig,
    plan: ProgressPlan,
    toolkit: Arc<dyn GenomicToolkit>,
    references: Arc<dyn ReferenceResolver>,
    comparator: Arc<dyn LineageTreeComparator>,
    sink: Arc<dyn RecordSink>,
    ledger: Arc<ReconciliationLedger>,
    store: CheckpointStore,
    active: Mutex<HashSet<PathBuf>>,
}

impl PipelineCoordinator {
    /// Records go to an in-memory sink and lineage labels are compared by
    /// name until [`with_record_sink`](Self::with_record_sink) and
    /// [`with_comparator`](Self::with_comparator) say otherwise.
    pub fn new(
        config: PipelineConfig,
        toolkit: Arc<dyn GenomicToolkit>,
        references: Arc<dyn ReferenceResolver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let comparator: Arc<dyn LineageTreeComparator> = Arc::new(NomenclatureComparator);
        let sink: Arc<dyn RecordSink> = Arc::new(MemorySink::new());
        let ledger = Self::build_ledger(&config, &comparator, &sink);
        Ok(Self {
            plan: ProgressPlan::from_weights(&config.progress_weights),
            config,
            toolkit,
            references,
            comparator,
            sink,
            ledger,
            store: CheckpointStore::new(),
            active: Mutex::new(HashSet::new()),
        })
    }

    /// Resolves references the way `config` describes: its FASTA path,
    /// else its reference catalog.
    pub fn from_config(
        config: PipelineConfig,
        toolkit: Arc<dyn GenomicToolkit>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let references = resolver_from_config(&config)?;
        Self::new(config, toolkit, references)
    }

    fn build_ledger(
        config: &PipelineConfig,
        comparator: &Arc<dyn LineageTreeComparator>,
        sink: &Arc<dyn RecordSink>,
    ) -> Arc<ReconciliationLedger> {
        let engine = ConsensusEngine::new(comparator.clone(), config.minor_divergence_max_branches);
        Arc::new(ReconciliationLedger::new(engine, sink.clone()))
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn LineageTreeComparator>) -> Self {
        self.comparator = comparator;
        self.ledger = Self::build_ledger(&self.config, &self.comparator, &self.sink);
        self
    }

    pub fn with_record_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = sink;
        self.ledger = Self::build_ledger(&self.config, &self.comparator, &self.sink);
        self
    }

    /// Shares a ledger between coordinators, e.g. one per reference build.
    pub fn with_ledger(mut self, ledger: Arc<ReconciliationLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ReconciliationLedger> {
        &self.ledger
    }

    pub fn namespace_for(&self, input: &AlignmentInput) -> ArtifactNamespace {
        ArtifactNamespace::for_input(&self.config.artifact_root, input)
    }

    /// Forgets every stage of `input`; the next run starts from scratch.
    /// The run's lineage calls leave the consensus until they are recomputed.
    pub fn invalidate(&self, input: &AlignmentInput) -> Result<(), CheckpointError> {
        self.store.invalidate(&self.namespace_for(input))?;
        self.ledger.remove_run(&input.subject_id, &input.run_id);
        Ok(())
    }

    /// Forgets one stage of `input` so the next run retries only that stage.
    pub fn invalidate_stage(
        &self,
        input: &AlignmentInput,
        stage: StageId,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let checkpoint = self.store.invalidate_stage(&self.namespace_for(input), stage)?;
        if let Some(lineage_type) = stage.lineage_type() {
            self.ledger
                .remove_call(&input.subject_id, lineage_type, &input.run_id);
        }
        if let Some(checkpoint) = &checkpoint
            && let Err(e) = self.sink.emit(PipelineRecord::Checkpoint(checkpoint.clone()))
        {
            warn!(%stage, error = %e, "could not persist invalidated checkpoint");
        }
        Ok(checkpoint)
    }

    pub fn run(
        &self,
        input: &AlignmentInput,
        progress: &mut dyn ProgressSink,
    ) -> Result<BatchResult, PipelineError> {
        self.run_with_cancel(input, progress, &CancellationToken::new())
    }

    /// Runs every stage not yet done for `input`. `cancel` is consulted
    /// before each stage; a cancelled run keeps its checkpoint and resumes
    /// where it stopped.
    pub fn run_with_cancel(
        &self,
        input: &AlignmentInput,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, PipelineError> {
        let span = info_span!(
            "pipeline",
            subject = %input.subject_id,
            run = %input.run_id,
            alignment = %input.alignment_id
        );
        let _entered = span.enter();

        let namespace = self.namespace_for(input);
        let _claim = self.claim(&namespace)?;
        self.ensure_namespace(&namespace)?;
        let mut reporter = ProgressReporter::new(progress, &self.plan);

        let fingerprint = match fingerprint_file(&input.alignment_path, self.config.fingerprint) {
            Ok(fingerprint) => fingerprint,
            Err(source) => {
                let err = PipelineError::AlignmentUnreadable {
                    path: input.alignment_path.clone(),
                    source,
                };
                error!(error = %err, "aborting run");
                reporter.fatal(0.0, &err.to_string());
                return Err(err);
            }
        };
        let checkpoint = self.store.load_and_validate(&namespace, input, &fingerprint);
        debug!(done = checkpoint.done_stages().len(), "checkpoint loaded");

        let reference_path = self.resolve_reference(&mut reporter)?;
        let mut result = BatchResult::for_input(input);
        result.reference_path = Some(canonical_or_display(&reference_path));
        let mut state = RunState {
            checkpoint,
            snapshot: PipelineSnapshot::new(input),
            result,
            reference_path,
            unrestored: Vec::new(),
        };

        for stage in StageId::ALL {
            if cancel.is_cancelled() {
                let completed = state.checkpoint.done_stages();
                let err = PipelineError::Cancelled { completed };
                info!(next = %stage, "{err}");
                reporter.fatal(self.plan.stage(stage).start, &err.to_string());
                return Err(err);
            }
            if state.checkpoint.is_done(stage) {
                self.restore_stage(input, &namespace, stage, &mut state, &mut reporter);
            } else {
                self.execute_stage(input, &namespace, stage, &mut state, &mut reporter);
            }
        }

        let mut result = state.result;
        for lineage_type in LineageType::ALL {
            if result.lineage(lineage_type).is_some()
                && let Some(record) = self.ledger.record(&input.subject_id, lineage_type)
            {
                result.reconciliations.push(record);
            }
        }
        info!(
            executed = result.executed_stages.len(),
            cached = result.cached_stages.len(),
            failed = result.failures.len(),
            skipped = result.skipped.len(),
            "pipeline finished"
        );
        reporter.complete("Pipeline finished");
        Ok(result)
    }

    /// Runs one lineage stage outside the stage loop.
    ///
    /// The checkpoint is neither read nor written, so the sex gate does not
    /// apply and the stage output is not cached; the variant file write-back
    /// and the consensus update still happen.
    pub fn run_lineage_stage(
        &self,
        input: &AlignmentInput,
        lineage_type: LineageType,
        progress: &mut dyn ProgressSink,
    ) -> Result<BatchResult, PipelineError> {
        let span = info_span!(
            "lineage_stage",
            subject = %input.subject_id,
            run = %input.run_id,
            alignment = %input.alignment_id,
            %lineage_type
        );
        let _entered = span.enter();

        let namespace = self.namespace_for(input);
        let _claim = self.claim(&namespace)?;
        self.ensure_namespace(&namespace)?;
        let stage = StageId::for_lineage(lineage_type);
        let plan = ProgressPlan::single_stage(stage);
        let mut reporter = ProgressReporter::new(progress, &plan);
        let reference_path = self.resolve_reference(&mut reporter)?;

        let mut result = BatchResult::for_input(input);
        result.reference_path = Some(canonical_or_display(&reference_path));
        reporter.started(stage);
        let mut warnings = Vec::new();
        let outcome = {
            let mut on_progress = |message: &str, current: u64, total: u64| {
                reporter.stage_progress(stage, message, current, total)
            };
            let mut ctx = StageContext::new(
                &input.alignment_path,
                &reference_path,
                &namespace,
                &mut on_progress,
            );
            self.lineage_call(input, lineage_type, &mut ctx, &mut warnings)
        };
        result.executed_stages.push(stage);
        match outcome {
            Ok(call) => {
                info!(label = %call.label, source = ?call.variant_source, "lineage stage completed");
                match self.reconcile(input, &call) {
                    Ok(record) => result.reconciliations.push(record),
                    Err(e) => note_warning(
                        &mut warnings,
                        format!("{lineage_type} call of run '{}' was not reconciled: {e}", input.run_id),
                    ),
                }
                result.absorb(lineage_output(call));
                reporter.finished(stage);
            }
            Err(e) => {
                let reason = format!("{e:#}");
                warn!(%reason, "lineage stage failed");
                reporter.soft_failed(stage, &reason);
                result.failures.push(StageFailure { stage, reason });
            }
        }
        result.warnings.extend(warnings);
        reporter.complete("Lineage stage finished");
        Ok(result)
    }

    fn claim(&self, namespace: &ArtifactNamespace) -> Result<NamespaceClaim<'_>, PipelineError> {
        let root = namespace.root().to_path_buf();
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(root.clone()) {
            return Err(PipelineError::DuplicateNamespace(root.display().to_string()));
        }
        Ok(NamespaceClaim {
            active: &self.active,
            root,
        })
    }

    fn ensure_namespace(&self, namespace: &ArtifactNamespace) -> Result<(), PipelineError> {
        namespace.ensure().map_err(|source| PipelineError::Namespace {
            path: namespace.root().to_path_buf(),
            source,
        })
    }

    /// The only precondition whose failure aborts a run.
    fn resolve_reference(&self, reporter: &mut ProgressReporter<'_>) -> Result<PathBuf, PipelineError> {
        let build = self.config.reference_build.as_str();
        info!(%build, "resolving reference genome");
        let resolved = self
            .references
            .resolve(build, &mut |done, total| reporter.reference(build, done, total));
        match resolved {
            Ok(path) => {
                debug!(path = %path.display(), "reference ready");
                Ok(path)
            }
            Err(e) => {
                let err = PipelineError::FatalPrecondition {
                    build: build.to_string(),
                    cause: format!("{e:#}"),
                };
                error!(error = %err, "aborting run");
                reporter.fatal(0.0, &err.to_string());
                Err(err)
            }
        }
    }

    /// Answers a done stage from the checkpoint without invoking anything.
    fn restore_stage(
        &self,
        input: &AlignmentInput,
        namespace: &ArtifactNamespace,
        stage: StageId,
        state: &mut RunState,
        reporter: &mut ProgressReporter<'_>,
    ) {
        let disposition = state.checkpoint.mark(stage).map(|m| m.disposition.clone());
        match disposition {
            Some(StageDisposition::Completed) => match namespace.read_stage_output(stage) {
                Ok(Some(output)) => {
                    if let StageOutput::MtLineage(call) | StageOutput::PaternalLineage(call) =
                        &output
                        && let Err(e) = self.ledger.restore_call(run_call(input, call))
                    {
                        state.warn(format!(
                            "Cached {} call of run '{}' was not reconciled: {e}",
                            call.lineage_type, input.run_id
                        ));
                    }
                    state.absorb(output);
                }
                Ok(None) => {
                    state.unrestored.push(stage);
                    state.warn(format!(
                        "Cached output of stage '{stage}' is missing; invalidate the stage to recompute it"
                    ))
                }
                Err(e) => {
                    state.unrestored.push(stage);
                    state.warn(format!(
                        "Cached output of stage '{stage}' is unreadable ({e}); invalidate the stage to recompute it"
                    ))
                }
            },
            Some(StageDisposition::SoftFailed { reason }) => {
                state.result.failures.push(StageFailure { stage, reason })
            }
            Some(StageDisposition::Skipped { reason }) => {
                state.result.skipped.push(StageSkip { stage, reason })
            }
            None => {}
        }
        debug!(%stage, "stage answered from checkpoint");
        state.result.cached_stages.push(stage);
        reporter.cached(stage);
    }

    #[instrument(name = "stage", skip_all, fields(stage = %stage))]
    fn execute_stage(
        &self,
        input: &AlignmentInput,
        namespace: &ArtifactNamespace,
        stage: StageId,
        state: &mut RunState,
        reporter: &mut ProgressReporter<'_>,
    ) {
        info!("stage started");
        reporter.started(stage);
        let mut warnings = Vec::new();
        let attempt = {
            let mut on_progress = |message: &str, current: u64, total: u64| {
                reporter.stage_progress(stage, message, current, total)
            };
            let mut ctx = StageContext::new(
                &input.alignment_path,
                &state.reference_path,
                namespace,
                &mut on_progress,
            );
            self.attempt_stage(
                input,
                stage,
                &state.checkpoint,
                state.result.variants.as_ref(),
                &mut ctx,
                &mut warnings,
            )
        };
        state.result.warnings.extend(warnings);
        state.result.executed_stages.push(stage);

        let disposition = match attempt {
            StageAttempt::Completed(output) => {
                if let Err(e) = namespace.write_stage_output(&output) {
                    state.warn(format!("Could not cache output of stage '{stage}': {e}"));
                }
                state.carry_forward(&output);
                let lineage_call = match &output {
                    StageOutput::MtLineage(call) | StageOutput::PaternalLineage(call) => {
                        Some(call.clone())
                    }
                    _ => None,
                };
                state.absorb(output);
                for record in state.snapshot.records_for(stage) {
                    // a record built without a stage's cached values would
                    // overwrite the stored ones with blanks
                    if let Some(missing) = record_sources(&record)
                        .iter()
                        .copied()
                        .find(|source| state.unrestored.contains(source))
                    {
                        state.warn(format!(
                            "Did not persist {} record: output of stage '{missing}' is missing",
                            record.key().kind()
                        ));
                        continue;
                    }
                    self.emit(record, state);
                }
                if let Some(call) = lineage_call
                    && let Err(e) = self.reconcile(input, &call)
                {
                    state.warn(format!(
                        "{} call of run '{}' was not reconciled: {e}",
                        call.lineage_type, input.run_id
                    ));
                }
                info!("stage completed");
                reporter.finished(stage);
                StageDisposition::Completed
            }
            StageAttempt::SoftFailed(reason) => {
                warn!(%reason, "stage failed; continuing");
                if stage == StageId::VariantCalling {
                    // a partial file must not be offered to the lineage stages
                    let path = namespace.pipeline_variants_path();
                    if let Err(e) = remove_if_exists(&path) {
                        state.warn(format!(
                            "Could not remove partial variant file '{}': {e}",
                            path.display()
                        ));
                    }
                }
                reporter.soft_failed(stage, &reason);
                state.result.failures.push(StageFailure {
                    stage,
                    reason: reason.clone(),
                });
                StageDisposition::SoftFailed { reason }
            }
            StageAttempt::Skipped(reason) => {
                info!(%reason, "stage skipped");
                reporter.skipped(stage, &reason.to_string());
                state.result.skipped.push(StageSkip {
                    stage,
                    reason: reason.clone(),
                });
                StageDisposition::Skipped { reason }
            }
        };
        self.record_transition(namespace, stage, disposition, state);
    }

    fn attempt_stage(
        &self,
        input: &AlignmentInput,
        stage: StageId,
        checkpoint: &Checkpoint,
        variants: Option<&VariantCallSummary>,
        ctx: &mut StageContext<'_>,
        warnings: &mut Vec<String>,
    ) -> StageAttempt {
        let outcome = match stage {
            StageId::ReadMetrics => self.toolkit.read_metrics(ctx).map(StageOutput::ReadMetrics),
            StageId::Coverage => self
                .toolkit
                .coverage(ctx, checkpoint.read_length_estimate)
                .map(StageOutput::Coverage),
            StageId::CallableLoci => self
                .toolkit
                .callable_loci(ctx)
                .map(StageOutput::CallableLoci),
            StageId::SexInference => match input.declared_sex {
                Some(sex) => {
                    debug!(?sex, "using declared sex");
                    Ok(StageOutput::SexInference(SexCall::user_provided(sex)))
                }
                None => self.toolkit.infer_sex(ctx).map(StageOutput::SexInference),
            },
            StageId::VariantCalling => {
                let output_path = ctx.namespace.pipeline_variants_path();
                self.toolkit
                    .call_variants(ctx, checkpoint.sex.as_ref(), &output_path)
                    .map(StageOutput::VariantCalling)
            }
            StageId::MtLineage => self
                .lineage_call(input, LineageType::Maternal, ctx, warnings)
                .map(lineage_output),
            StageId::PaternalLineage => {
                if let Some(sex) = checkpoint.sex.as_ref().filter(|s| s.is_confident_female()) {
                    return StageAttempt::Skipped(SkipReason::FemaleSubject {
                        user_provided: sex.provenance == SexProvenance::UserProvided,
                    });
                }
                self.lineage_call(input, LineageType::Paternal, ctx, warnings)
                    .map(lineage_output)
            }
            StageId::Ancestry => self.toolkit.ancestry(ctx, variants).map(StageOutput::Ancestry),
        };
        match outcome {
            Ok(output) => StageAttempt::Completed(output),
            Err(e) => StageAttempt::SoftFailed(format!("{e:#}")),
        }
    }

    /// Resolves the variant source, calls the executor and caches anything
    /// computed from the raw alignment.
    fn lineage_call(
        &self,
        input: &AlignmentInput,
        lineage_type: LineageType,
        ctx: &mut StageContext<'_>,
        warnings: &mut Vec<String>,
    ) -> anyhow::Result<LineageCallOutput> {
        let namespace = ctx.namespace;
        let resolution = fallback::resolve_lineage_source(input, namespace, lineage_type);
        let cache_path = namespace.lineage_variants_path(lineage_type);
        let request = LineageRequest {
            lineage_type,
            source: &resolution,
            cache_path: &cache_path,
        };
        let evidence = self.toolkit.lineage(ctx, &request)?;
        if resolution.is_raw() {
            match fallback::write_back(namespace, lineage_type, evidence.produced_variants.as_deref()) {
                Ok(Some(path)) => debug!(path = %path.display(), "lineage variants cached"),
                Ok(None) => {}
                Err(e) => note_warning(
                    warnings,
                    format!("Could not cache {lineage_type} lineage variants: {e}"),
                ),
            }
        }
        Ok(LineageCallOutput {
            lineage_type,
            label: evidence.label,
            confidence: evidence.confidence,
            supporting_variants: evidence.supporting_variants,
            conflicting_variants: evidence.conflicting_variants,
            variant_source: resolution.source_kind(),
        })
    }

    fn reconcile(
        &self,
        input: &AlignmentInput,
        call: &LineageCallOutput,
    ) -> Result<ReconciliationRecord, ConsensusInputError> {
        self.ledger.add_call(run_call(input, call))
    }

    /// Persists the stage's mark. A failed save keeps the mark in memory so
    /// the rest of this run still sees it; the next run repeats the stage.
    fn record_transition(
        &self,
        namespace: &ArtifactNamespace,
        stage: StageId,
        disposition: StageDisposition,
        state: &mut RunState,
    ) {
        match self
            .store
            .mark_stage_complete(namespace, &state.checkpoint, stage, disposition.clone())
        {
            Ok(next) => state.checkpoint = next,
            Err(e) => {
                state.warn(format!("Checkpoint for stage '{stage}' was not saved: {e}"));
                state.checkpoint.stages.insert(
                    stage,
                    StageMark {
                        disposition,
                        recorded_at_unix_ms: now_unix_ms(),
                    },
                );
            }
        }
        self.emit(PipelineRecord::Checkpoint(state.checkpoint.clone()), state);
    }

    fn emit(&self, record: PipelineRecord, state: &mut RunState) {
        let key = record.key();
        if let Err(e) = self.sink.emit(record) {
            state.warn(format!("Could not persist {} record: {e:#}", key.kind()));
        }
    }
}

fn run_call(input: &AlignmentInput, call: &LineageCallOutput) -> RunLineageCall {
    RunLineageCall {
        subject_id: input.subject_id.clone(),
        source_run: input.run_id.clone(),
        lineage_type: call.lineage_type,
        label: call.label.clone(),
        confidence: call.confidence,
        tier: input.technology,
        supporting_variants: call.supporting_variants,
        conflicting_variants: call.conflicting_variants,
        called_at_unix_ms: now_unix_ms(),
    }
}

fn lineage_output(call: LineageCallOutput) -> StageOutput {
    match call.lineage_type {
        LineageType::Maternal => StageOutput::MtLineage(call),
        LineageType::Paternal => StageOutput::PaternalLineage(call),
    }
}
