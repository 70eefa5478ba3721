//! Background execution: one pipeline per thread, or a batch of distinct
//! alignments on the rayon pool.

use crate::coordinator::PipelineCoordinator;
use crate::error::PipelineError;
use crate::progress::{ProgressSink, ProgressUpdate};
use haplocall_protocol::{AlignmentInput, BatchResult};
use itertools::Itertools;
use rayon::prelude::*;
use std::any::Any;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::info;

/// Shared stop flag, checked by the coordinator between stages only.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct PipelineHandle {
    cancel: CancellationToken,
    handle: JoinHandle<Result<BatchResult, PipelineError>>,
}

impl PipelineHandle {
    /// Stops the run before its next stage. The stage in flight finishes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<BatchResult, PipelineError> {
        self.handle
            .join()
            .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(payload.as_ref()))))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Runs `input` on a dedicated thread; progress is delivered to `progress`
/// on that thread.
pub fn spawn_pipeline(
    coordinator: Arc<PipelineCoordinator>,
    input: AlignmentInput,
    mut progress: impl ProgressSink + Send + 'static,
) -> io::Result<PipelineHandle> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = thread::Builder::new()
        .name(format!("haplocall-{}", input.alignment_id))
        .spawn(move || coordinator.run_with_cancel(&input, &mut progress, &token))?;
    Ok(PipelineHandle { cancel, handle })
}

/// Runs several alignments concurrently. Inputs sharing an artifact
/// namespace are refused before anything starts; per-input results keep
/// the order of `inputs`.
pub fn run_batch(
    coordinator: &PipelineCoordinator,
    inputs: &[AlignmentInput],
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(&AlignmentInput, ProgressUpdate) + Sync),
) -> Result<Vec<Result<BatchResult, PipelineError>>, PipelineError> {
    if let Some(duplicate) = inputs
        .iter()
        .map(|input| coordinator.namespace_for(input).root().to_path_buf())
        .duplicates()
        .next()
    {
        return Err(PipelineError::DuplicateNamespace(
            duplicate.display().to_string(),
        ));
    }
    info!(alignments = inputs.len(), "starting batch");
    let results: Vec<_> = inputs
        .par_iter()
        .map(|input| {
            let mut sink = |update: ProgressUpdate| on_progress(input, update);
            coordinator.run_with_cancel(input, &mut sink, cancel)
        })
        .collect();
    info!(
        succeeded = results.iter().filter(|r| r.is_ok()).count(),
        failed = results.iter().filter(|r| r.is_err()).count(),
        "batch finished"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ChannelSink;
    use crate::test_support::{Harness, ScriptedToolkit};
    use haplocall_protocol::StageId;
    use std::sync::Mutex;
    use std::sync::mpsc;

    #[test]
    fn test_spawned_pipeline_reports_through_channel() {
        let hx = Harness::new(ScriptedToolkit::new());
        let (tx, rx) = mpsc::channel();
        let handle = spawn_pipeline(hx.coordinator.clone(), hx.input.clone(), ChannelSink(tx))
            .unwrap();
        let result = handle.join().unwrap();
        assert_eq!(result.executed_stages, StageId::ALL.to_vec());

        let updates: Vec<ProgressUpdate> = rx.iter().collect();
        let last = updates.last().unwrap();
        assert!(last.is_complete);
        assert_eq!(last.error, None);
        assert!(
            updates
                .windows(2)
                .all(|w| w[0].fraction <= w[1].fraction + 1e-12)
        );
    }

    #[test]
    fn test_cancel_takes_effect_between_stages() {
        let toolkit = ScriptedToolkit::new();
        let gate = toolkit.gate(StageId::ReadMetrics);
        let hx = Harness::new(toolkit);
        let handle = spawn_pipeline(hx.coordinator.clone(), hx.input.clone(), |_: ProgressUpdate| {}).unwrap();
        gate.entered.recv().unwrap();
        handle.cancel();
        gate.release.send(()).unwrap();
        match handle.join() {
            Err(PipelineError::Cancelled { completed }) => {
                assert_eq!(completed, vec![StageId::ReadMetrics])
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(hx.toolkit.calls(StageId::Coverage), 0);

        let resumed = hx.run().unwrap();
        assert_eq!(resumed.cached_stages, vec![StageId::ReadMetrics]);
        assert_eq!(hx.toolkit.calls(StageId::ReadMetrics), 1);
        assert_eq!(hx.toolkit.calls(StageId::Coverage), 1);
    }

    #[test]
    fn test_panicking_executor_surfaces_as_error() {
        let hx = Harness::new(ScriptedToolkit::new().panicking(StageId::CallableLoci));
        let handle = spawn_pipeline(hx.coordinator.clone(), hx.input.clone(), |_: ProgressUpdate| {}).unwrap();
        match handle.join() {
            Err(PipelineError::Panicked(message)) => assert!(message.contains("callable")),
            other => panic!("expected panic, got {other:?}"),
        }
        // the namespace claim is released by unwinding
        assert!(hx.run().is_ok());
    }

    #[test]
    fn test_batch_runs_distinct_alignments() {
        let hx = Harness::new(ScriptedToolkit::new());
        let second = hx.second_alignment("a2", b"other alignment bytes");
        let seen = Mutex::new(Vec::new());
        let results = run_batch(
            &hx.coordinator,
            &[hx.input.clone(), second],
            &CancellationToken::new(),
            &|input, update| {
                if update.is_complete {
                    seen.lock().unwrap().push(input.alignment_id.clone());
                }
            },
        )
        .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(results[1].as_ref().unwrap().alignment_id, "a2");
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(hx.toolkit.calls(StageId::ReadMetrics), 2);
    }

    #[test]
    fn test_batch_rejects_shared_namespace() {
        let hx = Harness::new(ScriptedToolkit::new());
        let err = run_batch(
            &hx.coordinator,
            &[hx.input.clone(), hx.input.clone()],
            &CancellationToken::new(),
            &|_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateNamespace(_)));
        assert_eq!(hx.toolkit.total_calls(), 0);
    }

    #[test]
    fn test_cancelled_batch_runs_nothing() {
        let hx = Harness::new(ScriptedToolkit::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = run_batch(&hx.coordinator, &[hx.input.clone()], &cancel, &|_, _| {}).unwrap();
        assert!(matches!(
            results[0],
            Err(PipelineError::Cancelled { ref completed }) if completed.is_empty()
        ));
        assert_eq!(hx.toolkit.total_calls(), 0);
    }

    #[test]
    fn test_batch_accepts_ids_differing_only_in_punctuation() {
        let hx = Harness::new(ScriptedToolkit::new());
        let dashed = AlignmentInput::new("Subject-1", "r1", "a1", &hx.input.alignment_path);
        let underscored = AlignmentInput::new("subject_1", "r1", "a1", &hx.input.alignment_path);
        let results = run_batch(
            &hx.coordinator,
            &[dashed, underscored],
            &CancellationToken::new(),
            &|_, _| {},
        )
        .unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(hx.toolkit.calls(StageId::ReadMetrics), 2);
    }
}
