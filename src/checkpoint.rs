//! Durable per-alignment record of which stages are done.
//!
//! The checkpoint is read once at the start of a run and rewritten after
//! every stage transition, so a crash after stage N resumes at N+1. A
//! checkpoint that cannot be read, or that was written for a different
//! fingerprint, is replaced by a fresh one together with every cached output
//! of the namespace.

use crate::error::CheckpointError;
use crate::namespace::{ArtifactNamespace, write_json_atomic};
use haplocall_protocol::{
    AlignmentInput, CHECKPOINT_SCHEMA_VERSION, Checkpoint, Fingerprint, LineageType,
    StageDisposition, StageId, StageMark, now_unix_ms,
};
use std::fs;
use std::io;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointStore;

impl CheckpointStore {
    pub fn new() -> Self {
        Self
    }

    /// Loads the stored checkpoint, or starts a fresh one when it is missing,
    /// unreadable, belongs to another alignment, or carries a stale fingerprint.
    pub fn load_and_validate(
        &self,
        namespace: &ArtifactNamespace,
        input: &AlignmentInput,
        current: &Fingerprint,
    ) -> Checkpoint {
        let fresh = || {
            Checkpoint::fresh(
                &input.subject_id,
                &input.run_id,
                &input.alignment_id,
                current.clone(),
            )
        };
        let stored = match self.load(namespace) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return fresh(),
            Err(e) => {
                warn!(error = %e, "discarding unreadable checkpoint");
                self.purge_cached_outputs(namespace);
                return fresh();
            }
        };
        if !stored.same_alignment(&input.subject_id, &input.run_id, &input.alignment_id) {
            warn!(
                stored_subject = %stored.subject_id,
                stored_run = %stored.run_id,
                stored_alignment = %stored.alignment_id,
                "checkpoint belongs to another alignment; starting over"
            );
            self.purge_cached_outputs(namespace);
            return fresh();
        }
        if stored.fingerprint != *current {
            info!(
                stored = %stored.fingerprint.digest,
                current = %current.digest,
                "alignment file changed; resetting checkpoint"
            );
            self.purge_cached_outputs(namespace);
            return fresh();
        }
        stored
    }

    pub fn load(&self, namespace: &ArtifactNamespace) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = namespace.checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&text).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                message: e.to_string(),
            })?;
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointError::Corrupt {
                path,
                message: format!(
                    "schema version {} is not supported (expected {})",
                    checkpoint.schema_version, CHECKPOINT_SCHEMA_VERSION
                ),
            });
        }
        Ok(Some(checkpoint))
    }

    pub fn save(
        &self,
        namespace: &ArtifactNamespace,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        let path = namespace.checkpoint_path();
        write_json_atomic(&path, checkpoint).map_err(|source| CheckpointError::Io { path, source })
    }

    /// Records `disposition` for `stage` and persists the result.
    ///
    /// Marks are monotonic within a fingerprint: a stage that is already done
    /// keeps its original mark and nothing is written.
    pub fn mark_stage_complete(
        &self,
        namespace: &ArtifactNamespace,
        checkpoint: &Checkpoint,
        stage: StageId,
        disposition: StageDisposition,
    ) -> Result<Checkpoint, CheckpointError> {
        if let Some(existing) = checkpoint.mark(stage) {
            debug!(%stage, existing = ?existing.disposition, "stage already marked; keeping mark");
            return Ok(checkpoint.clone());
        }
        let mut next = checkpoint.clone();
        let now = now_unix_ms();
        next.stages.insert(
            stage,
            StageMark {
                disposition,
                recorded_at_unix_ms: now,
            },
        );
        next.updated_at_unix_ms = now;
        self.save(namespace, &next)?;
        Ok(next)
    }

    /// Drops the whole checkpoint and every cached output; the next run
    /// recomputes all stages.
    pub fn invalidate(&self, namespace: &ArtifactNamespace) -> Result<(), CheckpointError> {
        let path = namespace.checkpoint_path();
        remove_if_exists(&path).map_err(|source| CheckpointError::Io { path, source })?;
        self.purge_cached_outputs(namespace);
        Ok(())
    }

    /// Clears one stage so that only it is retried on the next run.
    ///
    /// Returns the rewritten checkpoint, or `None` when there was nothing stored.
    pub fn invalidate_stage(
        &self,
        namespace: &ArtifactNamespace,
        stage: StageId,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(mut checkpoint) = self.load(namespace)? else {
            return Ok(None);
        };
        checkpoint.stages.remove(&stage);
        match stage {
            StageId::ReadMetrics => checkpoint.read_length_estimate = None,
            StageId::SexInference => {
                checkpoint.sex = None;
                // a skip justified by the old sex call must be re-evaluated
                if checkpoint.is_skipped(StageId::PaternalLineage) {
                    checkpoint.stages.remove(&StageId::PaternalLineage);
                }
            }
            _ => {}
        }
        checkpoint.updated_at_unix_ms = now_unix_ms();
        let output_path = namespace.stage_output_path(stage);
        namespace
            .remove_stage_output(stage)
            .map_err(|source| CheckpointError::Io {
                path: output_path,
                source,
            })?;
        let cached_variants = match stage.lineage_type() {
            Some(lineage_type) => Some(namespace.lineage_variants_path(lineage_type)),
            None if stage == StageId::VariantCalling => Some(namespace.pipeline_variants_path()),
            None => None,
        };
        if let Some(cached) = cached_variants {
            remove_if_exists(&cached).map_err(|source| CheckpointError::Io {
                path: cached,
                source,
            })?;
        }
        self.save(namespace, &checkpoint)?;
        info!(%stage, "stage invalidated");
        Ok(Some(checkpoint))
    }

    fn purge_cached_outputs(&self, namespace: &ArtifactNamespace) {
        let mut paths: Vec<_> = StageId::ALL
            .iter()
            .map(|stage| namespace.stage_output_path(*stage))
            .collect();
        paths.push(namespace.pipeline_variants_path());
        paths.extend(
            LineageType::ALL
                .iter()
                .map(|lineage_type| namespace.lineage_variants_path(*lineage_type)),
        );
        for path in paths {
            if let Err(e) = remove_if_exists(&path) {
                warn!(path = %path.display(), error = %e, "could not remove stale cached output");
            }
        }
    }
}

pub(crate) fn remove_if_exists(path: &std::path::Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
