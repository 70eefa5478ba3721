//! Persistence boundary.
//!
//! The pipeline and the consensus ledger emit whole records; a sink stores
//! the latest record per identity and never merges fields.

use crate::namespace::{id_path_component, write_json_atomic};
use anyhow::{Context, Result};
use haplocall_protocol::{
    AlignmentMetrics, Checkpoint, LineageType, ReconciliationRecord, RunMetrics, SubjectProfile,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "record")]
pub enum PipelineRecord {
    Checkpoint(Checkpoint),
    AlignmentMetrics(AlignmentMetrics),
    RunMetrics(RunMetrics),
    SubjectProfile(SubjectProfile),
    Reconciliation(ReconciliationRecord),
}

/// Identity under which a record replaces its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
    Checkpoint {
        subject_id: String,
        run_id: String,
        alignment_id: String,
    },
    AlignmentMetrics {
        subject_id: String,
        run_id: String,
        alignment_id: String,
    },
    RunMetrics {
        subject_id: String,
        run_id: String,
    },
    SubjectProfile {
        subject_id: String,
    },
    Reconciliation {
        subject_id: String,
        lineage_type: LineageType,
    },
}

impl RecordKey {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Checkpoint { .. } => "checkpoints",
            Self::AlignmentMetrics { .. } => "alignment_metrics",
            Self::RunMetrics { .. } => "run_metrics",
            Self::SubjectProfile { .. } => "subjects",
            Self::Reconciliation { .. } => "reconciliations",
        }
    }

    /// Filesystem-safe name unique within [`RecordKey::kind`].
    pub fn file_stem(&self) -> String {
        let parts: Vec<&str> = match self {
            Self::Checkpoint {
                subject_id,
                run_id,
                alignment_id,
            }
            | Self::AlignmentMetrics {
                subject_id,
                run_id,
                alignment_id,
            } => vec![subject_id.as_str(), run_id.as_str(), alignment_id.as_str()],
            Self::RunMetrics { subject_id, run_id } => vec![subject_id.as_str(), run_id.as_str()],
            Self::SubjectProfile { subject_id } => vec![subject_id.as_str()],
            Self::Reconciliation {
                subject_id,
                lineage_type,
            } => vec![subject_id.as_str(), lineage_type.as_str()],
        };
        parts
            .iter()
            .map(|p| id_path_component(p, "_"))
            .collect::<Vec<_>>()
            .join("__")
    }
}

impl PipelineRecord {
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Checkpoint(c) => RecordKey::Checkpoint {
                subject_id: c.subject_id.clone(),
                run_id: c.run_id.clone(),
                alignment_id: c.alignment_id.clone(),
            },
            Self::AlignmentMetrics(m) => RecordKey::AlignmentMetrics {
                subject_id: m.subject_id.clone(),
                run_id: m.run_id.clone(),
                alignment_id: m.alignment_id.clone(),
            },
            Self::RunMetrics(m) => RecordKey::RunMetrics {
                subject_id: m.subject_id.clone(),
                run_id: m.run_id.clone(),
            },
            Self::SubjectProfile(p) => RecordKey::SubjectProfile {
                subject_id: p.subject_id.clone(),
            },
            Self::Reconciliation(r) => RecordKey::Reconciliation {
                subject_id: r.subject_id.clone(),
                lineage_type: r.lineage_type,
            },
        }
    }
}

pub trait RecordSink: Send + Sync {
    fn emit(&self, record: PipelineRecord) -> Result<()>;

    /// The latest stored record for `key`, if any.
    fn load(&self, key: &RecordKey) -> Result<Option<PipelineRecord>>;
}

/// Keeps the latest record per identity in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<BTreeMap<RecordKey, PipelineRecord>>,
    emitted: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, key: &RecordKey) -> Option<PipelineRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn records(&self) -> Vec<PipelineRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of `emit` calls so far, including replacements.
    pub fn emit_count(&self) -> usize {
        *self.emitted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, record: PipelineRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.key(), record);
        *self.emitted.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn load(&self, key: &RecordKey) -> Result<Option<PipelineRecord>> {
        Ok(self.latest(key))
    }
}

/// One pretty-printed JSON file per identity: `<root>/<kind>/<stem>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    root: PathBuf,
}

impl JsonDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &RecordKey) -> PathBuf {
        self.root
            .join(key.kind())
            .join(format!("{}.json", key.file_stem()))
    }
}

impl RecordSink for JsonDirSink {
    fn emit(&self, record: PipelineRecord) -> Result<()> {
        let path = self.path_for(&record.key());
        write_json_atomic(&path, &record)
            .with_context(|| format!("Could not write record '{}'", path.display()))
    }

    fn load(&self, key: &RecordKey) -> Result<Option<PipelineRecord>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Could not read record '{}'", path.display()))?;
        let record = serde_json::from_str(&text)
            .with_context(|| format!("Could not parse record '{}'", path.display()))?;
        Ok(Some(record))
    }
}
