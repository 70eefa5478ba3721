use crate::config::ProgressWeights;
use haplocall_protocol::StageId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub message: String,
    /// Overall progress of the run in [0, 1].
    pub fraction: f64,
    pub is_complete: bool,
    pub error: Option<String>,
}

/// Receives progress notifications synchronously on the pipeline thread.
pub trait ProgressSink {
    fn notify(&mut self, update: ProgressUpdate);
}

impl<F: FnMut(ProgressUpdate)> ProgressSink for F {
    fn notify(&mut self, update: ProgressUpdate) {
        self(update)
    }
}

/// Forwards updates to another thread; a dropped receiver is ignored.
pub struct ChannelSink(pub Sender<ProgressUpdate>);

impl ProgressSink for ChannelSink {
    fn notify(&mut self, update: ProgressUpdate) {
        let _ = self.0.send(update);
    }
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn notify(&mut self, _update: ProgressUpdate) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRange {
    pub start: f64,
    pub end: f64,
}

impl ProgressRange {
    /// Maps executor sub-progress linearly into this range.
    pub fn at(&self, current: u64, total: u64) -> f64 {
        if total == 0 {
            return self.start;
        }
        let ratio = (current as f64 / total as f64).clamp(0.0, 1.0);
        self.start + ratio * (self.end - self.start)
    }
}

/// Fixed sub-ranges of [0, 1]: reference resolution first, then each stage
/// in pipeline order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressPlan {
    reference: ProgressRange,
    stages: BTreeMap<StageId, ProgressRange>,
}

impl ProgressPlan {
    pub fn from_weights(weights: &ProgressWeights) -> Self {
        let total = weights.total();
        let share = |w: f64| if total > 0.0 { w / total } else { 0.0 };
        let reference = ProgressRange {
            start: 0.0,
            end: share(weights.reference),
        };
        let mut cursor = reference.end;
        let mut stages = BTreeMap::new();
        for stage in StageId::ALL {
            let end = (cursor + share(weights.stage(stage))).min(1.0);
            stages.insert(stage, ProgressRange { start: cursor, end });
            cursor = end;
        }
        if let Some(last) = stages.get_mut(&StageId::Ancestry) {
            last.end = 1.0;
        }
        Self { reference, stages }
    }

    /// Plan for running one stage on its own: reference first, then `stage`
    /// owns the rest of the range.
    pub fn single_stage(stage: StageId) -> Self {
        let reference = ProgressRange {
            start: 0.0,
            end: 0.1,
        };
        let stages = BTreeMap::from([(
            stage,
            ProgressRange {
                start: reference.end,
                end: 1.0,
            },
        )]);
        Self { reference, stages }
    }

    pub fn reference(&self) -> ProgressRange {
        self.reference
    }

    pub fn stage(&self, stage: StageId) -> ProgressRange {
        self.stages
            .get(&stage)
            .copied()
            .unwrap_or(ProgressRange { start: 0.0, end: 0.0 })
    }
}

impl Default for ProgressPlan {
    fn default() -> Self {
        Self::from_weights(&ProgressWeights::default())
    }
}

/// Coordinator-side helper that turns stage events into sink notifications.
pub(crate) struct ProgressReporter<'a> {
    sink: &'a mut dyn ProgressSink,
    plan: &'a ProgressPlan,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(sink: &'a mut dyn ProgressSink, plan: &'a ProgressPlan) -> Self {
        Self { sink, plan }
    }

    fn emit(&mut self, message: String, fraction: f64, error: Option<String>) {
        self.sink.notify(ProgressUpdate {
            message,
            fraction: fraction.clamp(0.0, 1.0),
            is_complete: false,
            error,
        });
    }

    pub(crate) fn reference(&mut self, build: &str, bytes_done: u64, bytes_total: Option<u64>) {
        let range = self.plan.reference();
        let fraction = match bytes_total {
            Some(total) => range.at(bytes_done, total),
            None => range.start,
        };
        self.emit(format!("Resolving reference {build}"), fraction, None);
    }

    pub(crate) fn cached(&mut self, stage: StageId) {
        let end = self.plan.stage(stage).end;
        self.emit(format!("{} (cached)", stage.label()), end, None);
    }

    pub(crate) fn started(&mut self, stage: StageId) {
        let start = self.plan.stage(stage).start;
        self.emit(format!("{}...", stage.label()), start, None);
    }

    pub(crate) fn stage_progress(&mut self, stage: StageId, message: &str, current: u64, total: u64) {
        let fraction = self.plan.stage(stage).at(current, total);
        self.emit(format!("{}: {message}", stage.label()), fraction, None);
    }

    pub(crate) fn finished(&mut self, stage: StageId) {
        let end = self.plan.stage(stage).end;
        self.emit(format!("{} done", stage.label()), end, None);
    }

    pub(crate) fn skipped(&mut self, stage: StageId, reason: &str) {
        let end = self.plan.stage(stage).end;
        self.emit(format!("{} skipped: {reason}", stage.label()), end, None);
    }

    pub(crate) fn soft_failed(&mut self, stage: StageId, reason: &str) {
        let end = self.plan.stage(stage).end;
        self.emit(
            format!("{} failed", stage.label()),
            end,
            Some(reason.to_string()),
        );
    }

    pub(crate) fn complete(&mut self, message: &str) {
        self.sink.notify(ProgressUpdate {
            message: message.to_string(),
            fraction: 1.0,
            is_complete: true,
            error: None,
        });
    }

    pub(crate) fn fatal(&mut self, fraction: f64, error: &str) {
        self.sink.notify(ProgressUpdate {
            message: "Pipeline aborted".to_string(),
            fraction: fraction.clamp(0.0, 1.0),
            is_complete: true,
            error: Some(error.to_string()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_ranges_are_contiguous_and_cover_unit_interval() {
        let plan = ProgressPlan::default();
        assert_eq!(plan.reference().start, 0.0);
        let mut cursor = plan.reference().end;
        for stage in StageId::ALL {
            let range = plan.stage(stage);
            assert!((range.start - cursor).abs() < 1e-9);
            assert!(range.end >= range.start);
            cursor = range.end;
        }
        assert_eq!(cursor, 1.0);
    }

    #[test]
    fn test_weights_are_normalised() {
        let weights = ProgressWeights {
            reference: 0.0,
            read_metrics: 1.0,
            coverage: 3.0,
            callable_loci: 0.0,
            sex_inference: 0.0,
            variant_calling: 0.0,
            mt_lineage: 0.0,
            paternal_lineage: 0.0,
            ancestry: 0.0,
        };
        let plan = ProgressPlan::from_weights(&weights);
        assert_eq!(plan.stage(StageId::ReadMetrics).end, 0.25);
        assert_eq!(plan.stage(StageId::Coverage).start, 0.25);
        assert_eq!(plan.stage(StageId::Coverage).end, 1.0);
    }

    #[test]
    fn test_sub_progress_maps_linearly() {
        let range = ProgressRange {
            start: 0.2,
            end: 0.4,
        };
        assert_eq!(range.at(0, 10), 0.2);
        assert!((range.at(5, 10) - 0.3).abs() < 1e-12);
        assert!((range.at(20, 10) - 0.4).abs() < 1e-12);
        assert_eq!(range.at(3, 0), 0.2);
    }

    #[test]
    fn test_reporter_cached_event_reports_stage_end() {
        let plan = ProgressPlan::default();
        let mut seen = Vec::new();
        {
            let mut sink = |u: ProgressUpdate| seen.push(u);
            let mut reporter = ProgressReporter::new(&mut sink, &plan);
            reporter.cached(StageId::Coverage);
            reporter.complete("done");
        }
        assert_eq!(seen.len(), 2);
        assert!(seen[0].message.contains("cached"));
        assert_eq!(seen[0].fraction, plan.stage(StageId::Coverage).end);
        assert!(!seen[0].is_complete);
        assert!(seen[1].is_complete);
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut sink = ChannelSink(tx);
        drop(rx);
        sink.notify(ProgressUpdate {
            message: "x".to_string(),
            fraction: 0.5,
            is_complete: false,
            error: None,
        });
    }
}
