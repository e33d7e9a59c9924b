//! Durable per-task progress record.

use crate::engine::{FailureDetail, ResultStatus};
use crate::types::{ComplexityTier, Task, TaskKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub term_id: String,
    pub dimension_id: String,
    pub complexity: ComplexityTier,
    pub status: TaskStatus,
    /// Successful claims so far
    pub attempts: u32,
    /// Run id holding the claim while `InProgress`
    pub owner: Option<String>,
    pub claimed_at_ms: Option<u64>,
    pub updated_at_ms: u64,
    pub result_status: Option<ResultStatus>,
    pub last_error: Option<FailureDetail>,
}

impl CheckpointRecord {
    pub fn pending(task: &Task) -> Self {
        Self {
            term_id: task.term.id.clone(),
            dimension_id: task.dimension_id.clone(),
            complexity: task.complexity,
            status: TaskStatus::Pending,
            attempts: 0,
            owner: None,
            claimed_at_ms: None,
            updated_at_ms: now_millis(),
            result_status: None,
            last_error: None,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.term_id.clone(), self.dimension_id.clone())
    }

    /// Whether an `InProgress` claim is older than `staleness_ms`
    pub fn is_stale(&self, now_ms: u64, staleness_ms: u64) -> bool {
        self.status == TaskStatus::InProgress
            && self
                .claimed_at_ms
                .map_or(true, |at| now_ms.saturating_sub(at) >= staleness_ms)
    }

    pub(crate) fn mark_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.owner = None;
        self.claimed_at_ms = None;
        self.updated_at_ms = now_millis();
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
