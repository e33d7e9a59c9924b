//! Checkpoint Store
//!
//! Durable, sled-backed record of every task's progress plus the results it
//! produced. Multi-tree mutations go through sled transactions: a claim is a
//! compare-and-set that also reads the persisted stop state, and a record
//! only flips to `done` in the same commit that stores its result.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use tracing::{debug, info, warn};

use crate::engine::{GenerationResult, ResultStatus};
use crate::error::StorageError;
use crate::stop::{StopState, StopStatePersistence};
use crate::types::{Cost, Task, TaskKey};

pub mod export;
pub mod record;

pub use export::{export_results, ExportSummary};
pub use record::{now_millis, CheckpointRecord, TaskStatus};

const TREE_RECORDS: &str = "checkpoint_records";
const TREE_RESULTS: &str = "generation_results";
const TREE_META: &str = "checkpoint_meta";

const META_STOP_STATE: &[u8] = b"stop_state";
const META_SPEND: &[u8] = b"spend_picodollars";
const META_LAST_RUN: &[u8] = b"last_run_id";

/// Result of a claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the task; carries the updated record
    Claimed(CheckpointRecord),
    /// Another live owner holds the task
    AlreadyClaimed { owner: Option<String> },
    AlreadyDone,
    /// Failed earlier and not re-queued for this run
    PreviouslyFailed,
    /// A stop state is persisted; no claim may succeed
    Halted,
    /// Task was never seeded
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSummary {
    pub inserted: usize,
    pub existing: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSummary {
    pub reclaimed_in_progress: usize,
    pub requeued_failed: usize,
}

/// Per-status tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    /// Done records that were accepted
    pub completed: usize,
    /// Done records kept below the acceptance threshold
    pub completed_below_threshold: usize,
}

#[derive(Clone)]
pub struct CheckpointStore {
    db: Db,
    records: Tree,
    results: Tree,
    meta: Tree,
}

impl CheckpointStore {
    /// Open (or create) the store at `path` and reconcile it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            StorageError::IoError(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "Failed to open checkpoint database at {}: {}",
                    path.as_ref().display(),
                    e
                ),
            ))
        })?;
        let store = Self::new(db)?;
        let repaired = store.reconcile()?;
        if repaired > 0 {
            warn!(repaired, "Reset done records that had no stored result");
        }
        Ok(store)
    }

    pub fn new(db: Db) -> Result<Self, StorageError> {
        let records = db.open_tree(TREE_RECORDS)?;
        let results = db.open_tree(TREE_RESULTS)?;
        let meta = db.open_tree(TREE_META)?;
        Ok(Self {
            db,
            records,
            results,
            meta,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Insert a pending record for every task not yet known.
    pub fn seed(&self, tasks: &[Task]) -> Result<SeedSummary, StorageError> {
        let mut summary = SeedSummary::default();
        for task in tasks {
            let key = task.key().storage_key();
            let value = encode_record(&CheckpointRecord::pending(task))?;
            match self
                .records
                .compare_and_swap(&key, None as Option<&[u8]>, Some(value))?
            {
                Ok(()) => summary.inserted += 1,
                Err(_) => summary.existing += 1,
            }
        }
        debug!(
            inserted = summary.inserted,
            existing = summary.existing,
            "Seeded checkpoint records"
        );
        Ok(summary)
    }

    /// Return orphaned claims of earlier runs (and optionally failed tasks)
    /// to `pending` before a resumed run starts dispatching.
    pub fn prepare_resume(
        &self,
        run_id: &str,
        retry_failed: bool,
    ) -> Result<ResumeSummary, StorageError> {
        let mut summary = ResumeSummary::default();
        for entry in self.records.iter() {
            let (key, raw) = entry?;
            let mut record = decode_record(&raw)?;
            let requeue = match record.status {
                TaskStatus::InProgress if record.owner.as_deref() != Some(run_id) => {
                    summary.reclaimed_in_progress += 1;
                    true
                }
                TaskStatus::Failed if retry_failed => {
                    summary.requeued_failed += 1;
                    true
                }
                _ => false,
            };
            if requeue {
                record.mark_pending();
                let updated = encode_record(&record)?;
                // A concurrent writer wins; its state is at least as fresh.
                let _ = self.records.compare_and_swap(&key, Some(raw), Some(updated))?;
            }
        }
        info!(
            run_id,
            reclaimed_in_progress = summary.reclaimed_in_progress,
            requeued_failed = summary.requeued_failed,
            "Prepared checkpoint for resume"
        );
        Ok(summary)
    }

    /// Atomically claim `key` for `owner`.
    ///
    /// Succeeds from `pending`, or from an `in_progress` record whose claim is
    /// older than `staleness`. Fails with `Halted` whenever a stop state is
    /// persisted, checked in the same transaction.
    pub fn claim(
        &self,
        key: &TaskKey,
        owner: &str,
        staleness: Duration,
    ) -> Result<ClaimOutcome, StorageError> {
        let storage_key = key.storage_key();
        let staleness_ms = staleness.as_millis() as u64;

        let outcome = (&self.records, &self.meta).transaction(|(records, meta)| {
            if meta.get(META_STOP_STATE)?.is_some() {
                return Ok(ClaimOutcome::Halted);
            }
            let Some(raw) = records.get(&storage_key)? else {
                return Ok(ClaimOutcome::Missing);
            };
            let mut record = decode_record(&raw).map_err(ConflictableTransactionError::Abort)?;
            let now = now_millis();
            match record.status {
                TaskStatus::Done => return Ok(ClaimOutcome::AlreadyDone),
                TaskStatus::Failed => return Ok(ClaimOutcome::PreviouslyFailed),
                TaskStatus::InProgress if !record.is_stale(now, staleness_ms) => {
                    return Ok(ClaimOutcome::AlreadyClaimed {
                        owner: record.owner.clone(),
                    });
                }
                TaskStatus::InProgress | TaskStatus::Pending => {}
            }
            record.status = TaskStatus::InProgress;
            record.owner = Some(owner.to_string());
            record.claimed_at_ms = Some(now);
            record.updated_at_ms = now;
            record.attempts += 1;
            let encoded = encode_record(&record).map_err(ConflictableTransactionError::Abort)?;
            records.insert(storage_key.as_slice(), encoded)?;
            Ok(ClaimOutcome::Claimed(record))
        });
        flatten(outcome)
    }

    /// Store `result` and finish the record in one commit.
    ///
    /// Returns `false` when `owner` no longer held the claim (it went stale and
    /// was reclaimed); the result is written anyway and the last writer wins.
    pub fn complete(
        &self,
        key: &TaskKey,
        owner: &str,
        result: &GenerationResult,
    ) -> Result<bool, StorageError> {
        let storage_key = key.storage_key();
        let result_bytes = serde_json::to_vec(result).map_err(to_storage_data)?;

        let outcome = (&self.records, &self.results).transaction(|(records, results)| {
            let Some(raw) = records.get(&storage_key)? else {
                return Err(ConflictableTransactionError::Abort(
                    StorageError::RecordNotFound(key.clone()),
                ));
            };
            let mut record = decode_record(&raw).map_err(ConflictableTransactionError::Abort)?;
            let still_owner = record.status == TaskStatus::InProgress
                && record.owner.as_deref() == Some(owner);

            record.status = match result.status {
                ResultStatus::Failed => TaskStatus::Failed,
                ResultStatus::Completed | ResultStatus::CompletedBelowThreshold => {
                    TaskStatus::Done
                }
            };
            record.result_status = Some(result.status);
            record.last_error = result.error.clone();
            record.owner = None;
            record.claimed_at_ms = None;
            record.updated_at_ms = now_millis();

            let encoded = encode_record(&record).map_err(ConflictableTransactionError::Abort)?;
            records.insert(storage_key.as_slice(), encoded)?;
            results.insert(storage_key.as_slice(), result_bytes.as_slice())?;
            Ok(still_owner)
        });
        let still_owner = flatten(outcome)?;
        if !still_owner {
            warn!(task = %key, owner, "Completed a task whose claim had been taken over");
        }
        Ok(still_owner)
    }

    /// Return a claimed task to `pending` (used when in-flight work is cancelled).
    pub fn release(&self, key: &TaskKey, owner: &str) -> Result<bool, StorageError> {
        let storage_key = key.storage_key();
        let outcome = self.records.transaction(|records| {
            let Some(raw) = records.get(&storage_key)? else {
                return Ok(false);
            };
            let mut record = decode_record(&raw).map_err(ConflictableTransactionError::Abort)?;
            if record.status != TaskStatus::InProgress || record.owner.as_deref() != Some(owner) {
                return Ok(false);
            }
            record.mark_pending();
            let encoded = encode_record(&record).map_err(ConflictableTransactionError::Abort)?;
            records.insert(storage_key.as_slice(), encoded)?;
            Ok(true)
        });
        flatten(outcome)
    }

    /// Reset any `done` record without a stored result back to `pending`.
    pub fn reconcile(&self) -> Result<usize, StorageError> {
        let mut repaired = 0usize;
        for entry in self.records.iter() {
            let (key, raw) = entry?;
            let mut record = decode_record(&raw)?;
            if record.status == TaskStatus::Done && !self.results.contains_key(&key)? {
                record.mark_pending();
                record.result_status = None;
                let updated = encode_record(&record)?;
                if self
                    .records
                    .compare_and_swap(&key, Some(raw), Some(updated))?
                    .is_ok()
                {
                    repaired += 1;
                }
            }
        }
        Ok(repaired)
    }

    pub fn counts(&self) -> Result<StatusCounts, StorageError> {
        let mut counts = StatusCounts::default();
        for entry in self.records.iter() {
            let (_, raw) = entry?;
            let record = decode_record(&raw)?;
            counts.total += 1;
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Done => {
                    counts.done += 1;
                    match record.result_status {
                        Some(ResultStatus::CompletedBelowThreshold) => {
                            counts.completed_below_threshold += 1
                        }
                        _ => counts.completed += 1,
                    }
                }
            }
        }
        Ok(counts)
    }

    pub fn record(&self, key: &TaskKey) -> Result<Option<CheckpointRecord>, StorageError> {
        let Some(raw) = self.records.get(key.storage_key())? else {
            return Ok(None);
        };
        Ok(Some(decode_record(&raw)?))
    }

    pub fn records(&self) -> Result<Vec<CheckpointRecord>, StorageError> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            let (_, raw) = entry?;
            out.push(decode_record(&raw)?);
        }
        Ok(out)
    }

    pub fn result(&self, key: &TaskKey) -> Result<Option<GenerationResult>, StorageError> {
        let Some(raw) = self.results.get(key.storage_key())? else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&raw).map_err(to_storage_data)?;
        Ok(Some(parsed))
    }

    /// Every stored result, keyed by task
    pub fn results(&self) -> Result<BTreeMap<TaskKey, GenerationResult>, StorageError> {
        let mut out = BTreeMap::new();
        for entry in self.results.iter() {
            let (key, raw) = entry?;
            let Some(task) = TaskKey::from_storage_key(&key) else {
                warn!("Skipping result with undecodable key");
                continue;
            };
            let parsed: GenerationResult =
                serde_json::from_slice(&raw).map_err(to_storage_data)?;
            out.insert(task, parsed);
        }
        Ok(out)
    }

    /// Clear progress, results and persisted spend. The stop state survives.
    pub fn reset(&self) -> Result<(), StorageError> {
        self.records.clear()?;
        self.results.clear()?;
        self.meta.remove(META_SPEND)?;
        self.meta.remove(META_LAST_RUN)?;
        info!("Checkpoint progress reset");
        Ok(())
    }

    pub fn persist_spend(&self, total: Cost) -> Result<(), StorageError> {
        self.meta
            .insert(META_SPEND, total.picodollars().to_be_bytes().to_vec())?;
        Ok(())
    }

    pub fn load_spend(&self) -> Result<Cost, StorageError> {
        let Some(raw) = self.meta.get(META_SPEND)? else {
            return Ok(Cost::ZERO);
        };
        let bytes = <[u8; 8]>::try_from(&raw[..]).map_err(|_| {
            StorageError::Serialization("persisted spend is not an 8-byte integer".to_string())
        })?;
        Ok(Cost::from_picodollars(u64::from_be_bytes(bytes)))
    }

    pub fn set_last_run(&self, run_id: &str) -> Result<(), StorageError> {
        self.meta.insert(META_LAST_RUN, run_id.as_bytes())?;
        Ok(())
    }

    pub fn last_run(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .meta
            .get(META_LAST_RUN)?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl StopStatePersistence for CheckpointStore {
    fn persist_stop_state(&self, state: &StopState) -> Result<bool, StorageError> {
        let value = serde_json::to_vec(state).map_err(to_storage_data)?;
        let written = self
            .meta
            .compare_and_swap(META_STOP_STATE, None as Option<&[u8]>, Some(value))?
            .is_ok();
        self.db.flush()?;
        Ok(written)
    }

    fn load_stop_state(&self) -> Result<Option<StopState>, StorageError> {
        let Some(raw) = self.meta.get(META_STOP_STATE)? else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&raw).map_err(to_storage_data)?;
        Ok(Some(parsed))
    }

    fn clear_stop_state(&self) -> Result<bool, StorageError> {
        let removed = self.meta.remove(META_STOP_STATE)?.is_some();
        self.db.flush()?;
        Ok(removed)
    }
}

fn encode_record(record: &CheckpointRecord) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(record).map_err(|e| {
        StorageError::Serialization(format!("Failed to serialize checkpoint record: {}", e))
    })
}

fn decode_record(raw: &[u8]) -> Result<CheckpointRecord, StorageError> {
    bincode::deserialize(raw).map_err(|e| {
        StorageError::Serialization(format!("Corrupt checkpoint record: {}", e))
    })
}

fn flatten<T>(outcome: Result<T, TransactionError<StorageError>>) -> Result<T, StorageError> {
    outcome.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => StorageError::from(err),
    })
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}
