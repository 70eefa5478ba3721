//! Live reconciliation records with one writer per (subject, lineage type).
//!
//! A record is read from the sink the first time it is touched, so calls
//! persisted by an earlier process are kept when a new run adds its own.

use crate::consensus::ConsensusEngine;
use crate::error::ConsensusInputError;
use crate::records::{PipelineRecord, RecordKey, RecordSink};
use haplocall_protocol::{LineageType, ReconciliationRecord, RunLineageCall};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// `None` until the stored record has been loaded.
type Slot = Arc<Mutex<Option<ReconciliationRecord>>>;

pub struct ReconciliationLedger {
    engine: ConsensusEngine,
    sink: Arc<dyn RecordSink>,
    slots: Mutex<HashMap<(String, LineageType), Slot>>,
}

impl ReconciliationLedger {
    pub fn new(engine: ConsensusEngine, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            engine,
            sink,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a record loaded from storage. Replaces any live record for
    /// the same identity without emitting it.
    pub fn seed(&self, record: ReconciliationRecord) {
        let slot = self.slot(&record.subject_id, record.lineage_type);
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);
    }

    pub fn record(&self, subject_id: &str, lineage_type: LineageType) -> Option<ReconciliationRecord> {
        let slot = self.existing_slot(subject_id, lineage_type)?;
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(self.loaded(&mut guard, subject_id, lineage_type).clone())
    }

    pub fn add_call(&self, call: RunLineageCall) -> Result<ReconciliationRecord, ConsensusInputError> {
        let subject_id = call.subject_id.clone();
        let lineage_type = call.lineage_type;
        let run = call.source_run.clone();
        let slot = self.slot(&subject_id, lineage_type);
        let record = self.update(&slot, &subject_id, lineage_type, |engine, current| {
            engine.add_call(current, call)
        })?;
        info!(
            subject = %subject_id,
            %lineage_type,
            %run,
            compatibility = ?record.compatibility,
            "lineage call reconciled"
        );
        Ok(record)
    }

    /// Adds `call` only when its run has no call in the record yet. Used for
    /// calls answered from a checkpoint, which are already reconciled unless
    /// the record was lost.
    pub fn restore_call(
        &self,
        call: RunLineageCall,
    ) -> Result<ReconciliationRecord, ConsensusInputError> {
        let subject_id = call.subject_id.clone();
        let lineage_type = call.lineage_type;
        let slot = self.slot(&subject_id, lineage_type);
        self.update(&slot, &subject_id, lineage_type, |engine, current| {
            if current.call_for(&call.source_run).is_some() {
                return Ok(current.clone());
            }
            debug!(run = %call.source_run, "re-registering cached lineage call");
            engine.add_call(current, call)
        })
    }

    pub fn remove_call(
        &self,
        subject_id: &str,
        lineage_type: LineageType,
        source_run: &str,
    ) -> ReconciliationRecord {
        self.update_existing(subject_id, lineage_type, |engine, current| {
            engine.remove_call(current, source_run)
        })
    }

    /// Drops a deleted run's calls from every lineage type of the subject.
    pub fn remove_run(&self, subject_id: &str, source_run: &str) -> Vec<ReconciliationRecord> {
        LineageType::ALL
            .iter()
            .map(|lineage_type| self.remove_call(subject_id, *lineage_type, source_run))
            .collect()
    }

    pub fn recompute(&self, subject_id: &str, lineage_type: LineageType) -> ReconciliationRecord {
        self.update_existing(subject_id, lineage_type, |engine, current| {
            engine.recompute(current)
        })
    }

    fn stored(&self, subject_id: &str, lineage_type: LineageType) -> Option<ReconciliationRecord> {
        let key = RecordKey::Reconciliation {
            subject_id: subject_id.to_string(),
            lineage_type,
        };
        match self.sink.load(&key) {
            Ok(Some(PipelineRecord::Reconciliation(record))) => Some(record),
            Ok(_) => None,
            Err(e) => {
                warn!(subject = %subject_id, %lineage_type, error = %e, "could not load reconciliation record; starting empty");
                None
            }
        }
    }

    fn loaded<'a>(
        &self,
        slot: &'a mut Option<ReconciliationRecord>,
        subject_id: &str,
        lineage_type: LineageType,
    ) -> &'a mut ReconciliationRecord {
        slot.get_or_insert_with(|| {
            self.stored(subject_id, lineage_type)
                .unwrap_or_else(|| ReconciliationRecord::new(subject_id, lineage_type))
        })
    }

    fn slot(&self, subject_id: &str, lineage_type: LineageType) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((subject_id.to_string(), lineage_type))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// A live slot, or one holding the stored record. Never creates an
    /// empty slot, so lookups and removals for unknown subjects leave the
    /// map as it was.
    fn existing_slot(&self, subject_id: &str, lineage_type: LineageType) -> Option<Slot> {
        let key = (subject_id.to_string(), lineage_type);
        if let Some(slot) = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Some(slot.clone());
        }
        let stored = self.stored(subject_id, lineage_type)?;
        Some(
            self.slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(Some(stored))))
                .clone(),
        )
    }

    fn update_existing<F>(&self, subject_id: &str, lineage_type: LineageType, op: F) -> ReconciliationRecord
    where
        F: FnOnce(&ConsensusEngine, &ReconciliationRecord) -> ReconciliationRecord,
    {
        let Some(slot) = self.existing_slot(subject_id, lineage_type) else {
            return ReconciliationRecord::new(subject_id, lineage_type);
        };
        let Ok(record) = self.update(&slot, subject_id, lineage_type, |engine, current| {
            Ok::<_, Infallible>(op(engine, current))
        });
        record
    }

    /// Read-modify-write under the record's own lock. A changed record is
    /// emitted before the lock is released, so emissions follow update order.
    fn update<F, E>(
        &self,
        slot: &Slot,
        subject_id: &str,
        lineage_type: LineageType,
        op: F,
    ) -> Result<ReconciliationRecord, E>
    where
        F: FnOnce(&ConsensusEngine, &ReconciliationRecord) -> Result<ReconciliationRecord, E>,
    {
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.loaded(&mut guard, subject_id, lineage_type);
        let next = op(&self.engine, current)?;
        if next != *current {
            if let Err(e) = self.sink.emit(PipelineRecord::Reconciliation(next.clone())) {
                warn!(subject = %subject_id, %lineage_type, error = %e, "could not persist reconciliation record");
            }
            *current = next.clone();
        }
        Ok(next)
    }
}
