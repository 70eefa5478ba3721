//! Resumable, checkpointed analysis pipeline for sequencing alignments, with
//! cross-run reconciliation of paternal and maternal lineage calls.
//!
//! The genomic work itself happens behind [`stages::GenomicToolkit`]; this
//! crate decides what runs, in which order, from which inputs, and what is
//! remembered between runs.

pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod fallback;
pub mod fingerprint;
pub mod ledger;
pub mod lineage_tree;
pub mod namespace;
pub mod progress;
pub mod records;
pub mod references;
pub mod snapshot;
pub mod stages;
pub mod task;

#[cfg(test)]
mod test_support;

pub use haplocall_protocol as protocol;

pub use config::PipelineConfig;
pub use coordinator::PipelineCoordinator;
pub use error::{CheckpointError, ConfigError, ConsensusInputError, PipelineError};
pub use progress::{ChannelSink, NoProgress, ProgressSink, ProgressUpdate};
pub use task::{CancellationToken, PipelineHandle, run_batch, spawn_pipeline};
