use haplocall_protocol::{LineageType, StageId};
use std::path::PathBuf;
use thiserror::Error;

/// Terminal errors of a pipeline run. Stage failures never show up here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Reference genome '{build}' could not be resolved: {cause}")]
    FatalPrecondition { build: String, cause: String },

    #[error("Alignment file '{}' could not be fingerprinted: {source}", path.display())]
    AlignmentUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not prepare artifact namespace '{}': {source}", path.display())]
    Namespace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Pipeline cancelled after {} of {} stages", completed.len(), StageId::ALL.len())]
    Cancelled { completed: Vec<StageId> },

    #[error("Pipeline thread panicked: {0}")]
    Panicked(String),

    /// Another run already writes to this artifact namespace.
    #[error("Artifact namespace '{0}' already has an active pipeline run")]
    DuplicateNamespace(String),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint '{}' is corrupt: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },
}

/// A malformed lineage call; the record it was offered to stays unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsensusInputError {
    #[error("Lineage call from run '{run}' has an empty label")]
    EmptyLabel { run: String },

    #[error("Lineage call is missing its source run")]
    MissingSourceRun,

    #[error("Lineage call from run '{run}' has confidence {confidence} outside [0, 1]")]
    ConfidenceOutOfRange { run: String, confidence: f64 },

    #[error("Lineage call is {actual} but the record holds {expected} calls")]
    LineageTypeMismatch {
        expected: LineageType,
        actual: LineageType,
    },

    #[error("Lineage call belongs to subject '{actual}', record belongs to '{expected}'")]
    SubjectMismatch { expected: String, actual: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse config '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Could not load reference catalog '{}': {cause}", path.display())]
    ReferenceCatalog { path: PathBuf, cause: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_message_counts_stages() {
        let err = PipelineError::Cancelled {
            completed: vec![StageId::ReadMetrics, StageId::Coverage],
        };
        assert_eq!(err.to_string(), "Pipeline cancelled after 2 of 8 stages");
    }

    #[test]
    fn test_consensus_error_names_the_run() {
        let err = ConsensusInputError::ConfidenceOutOfRange {
            run: "run-7".to_string(),
            confidence: 1.5,
        };
        assert!(err.to_string().contains("run-7"));
    }
}
