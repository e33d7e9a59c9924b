//! Emergency Stop Controller
//!
//! Watches global halt conditions (cost ceiling, budget refusals, failure
//! rate, quality floor, concurrency ceiling, operator requests) and trips a
//! run-wide [`StopState`]. A trip is irreversible for the run, first writer
//! wins, and the state is persisted before it becomes visible so a restart
//! cannot silently resume a halted run.

use crate::error::StorageError;
use crate::ledger::UsageLedger;
use crate::types::Cost;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Name of the operator stop-request file inside the state directory
pub const STOP_FILE_NAME: &str = "STOP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    CostCeiling,
    BudgetExhausted,
    FailureRate,
    QualityFloor,
    ConcurrencyCeiling,
    Operator,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::CostCeiling => "cost_ceiling",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::FailureRate => "failure_rate",
            StopReason::QualityFloor => "quality_floor",
            StopReason::ConcurrencyCeiling => "concurrency_ceiling",
            StopReason::Operator => "operator",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopState {
    pub reason: StopReason,
    pub message: String,
    pub tripped_at: DateTime<Utc>,
}

impl StopState {
    pub fn new(reason: StopReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            tripped_at: Utc::now(),
        }
    }
}

impl fmt::Display for StopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (at {})",
            self.reason,
            self.message,
            self.tripped_at.to_rfc3339()
        )
    }
}

/// Durable home of the stop state
pub trait StopStatePersistence: Send + Sync {
    /// Persist `state` unless one is already stored. Returns whether it was written.
    fn persist_stop_state(&self, state: &StopState) -> Result<bool, StorageError>;

    fn load_stop_state(&self) -> Result<Option<StopState>, StorageError>;

    /// Returns whether a state was removed.
    fn clear_stop_state(&self) -> Result<bool, StorageError>;
}

/// `[safety]` configuration table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopThresholds {
    pub max_total_cost_usd: f64,
    /// Failed / attempted over the trailing window, in (0, 1]
    pub max_failure_rate: f64,
    pub failure_window: usize,
    /// Attempts needed in the window before the failure rate is judged
    pub min_failure_samples: usize,
    /// Rolling average score floor; 0 disables the check
    pub min_rolling_quality: f64,
    pub quality_window: usize,
    pub quality_consecutive: usize,
    pub max_concurrent_operations: usize,
}

impl Default for StopThresholds {
    fn default() -> Self {
        Self {
            max_total_cost_usd: 50.0,
            max_failure_rate: 0.5,
            failure_window: 50,
            min_failure_samples: 10,
            min_rolling_quality: 5.0,
            quality_window: 20,
            quality_consecutive: 10,
            max_concurrent_operations: 100,
        }
    }
}

impl StopThresholds {
    pub fn cost_ceiling(&self) -> Cost {
        Cost::from_usd(self.max_total_cost_usd)
    }
}

#[derive(Debug, Default)]
struct Signals {
    outcomes: VecDeque<bool>,
    scores: VecDeque<u8>,
    below_floor_streak: usize,
}

impl Signals {
    fn failure_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let failed = self.outcomes.iter().filter(|ok| !**ok).count();
        Some(failed as f64 / self.outcomes.len() as f64)
    }

    fn rolling_quality(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        let sum: u32 = self.scores.iter().map(|s| u32::from(*s)).sum();
        Some(f64::from(sum) / self.scores.len() as f64)
    }
}

pub struct EmergencyStopController {
    thresholds: StopThresholds,
    ledger: Arc<UsageLedger>,
    persistence: Arc<dyn StopStatePersistence>,
    stop_file: Option<PathBuf>,
    state: RwLock<Option<StopState>>,
    tripped: AtomicBool,
    trip_lock: Mutex<()>,
    signals: Mutex<Signals>,
    active_operations: Arc<AtomicUsize>,
}

impl EmergencyStopController {
    /// Build a controller, adopting any stop state already persisted.
    pub fn new(
        thresholds: StopThresholds,
        ledger: Arc<UsageLedger>,
        persistence: Arc<dyn StopStatePersistence>,
    ) -> Result<Self, StorageError> {
        let persisted = persistence.load_stop_state()?;
        if let Some(state) = &persisted {
            info!(reason = %state.reason, message = %state.message, "Loaded persisted stop state");
        }
        Ok(Self {
            thresholds,
            ledger,
            persistence,
            stop_file: None,
            tripped: AtomicBool::new(persisted.is_some()),
            state: RwLock::new(persisted),
            trip_lock: Mutex::new(()),
            signals: Mutex::new(Signals::default()),
            active_operations: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Watch `path` for an operator stop request.
    pub fn with_stop_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stop_file = Some(path.into());
        self
    }

    pub fn thresholds(&self) -> &StopThresholds {
        &self.thresholds
    }

    pub fn is_stopped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> Option<StopState> {
        self.state.read().clone()
    }

    /// Evaluate every halt condition and return the stop state, if any.
    pub fn check(&self) -> Option<StopState> {
        if self.is_stopped() {
            return self.state();
        }

        let spent = self.ledger.total_cost();
        let ceiling = self.thresholds.cost_ceiling();
        if spent > ceiling {
            return Some(self.trip(
                StopReason::CostCeiling,
                format!("total cost {} exceeds ceiling {}", spent, ceiling),
            ));
        }

        let active = self.active_operations.load(Ordering::SeqCst);
        if active > self.thresholds.max_concurrent_operations {
            return Some(self.trip(
                StopReason::ConcurrencyCeiling,
                format!(
                    "{} concurrent operations exceed ceiling {}",
                    active, self.thresholds.max_concurrent_operations
                ),
            ));
        }

        if let Some(message) = self.pending_stop_request() {
            return Some(self.trip(StopReason::Operator, message));
        }

        if let Some(message) = self.failure_rate_breach() {
            return Some(self.trip(StopReason::FailureRate, message));
        }

        None
    }

    /// Feed one finished (non-failed) task into the rolling signals.
    pub fn record_completion(&self, score: Option<u8>) {
        let quality_breach = {
            let mut signals = self.signals.lock();
            push_bounded(&mut signals.outcomes, true, self.thresholds.failure_window);
            if let Some(score) = score {
                push_bounded(&mut signals.scores, score, self.thresholds.quality_window);
            }
            let floor = self.thresholds.min_rolling_quality;
            match signals.rolling_quality() {
                Some(avg) if floor > 0.0 && avg < floor => {
                    signals.below_floor_streak += 1;
                    (signals.below_floor_streak >= self.thresholds.quality_consecutive.max(1))
                        .then(|| {
                            format!(
                                "rolling quality {:.2} below {:.2} for {} consecutive completions",
                                avg, floor, signals.below_floor_streak
                            )
                        })
                }
                _ => {
                    signals.below_floor_streak = 0;
                    None
                }
            }
        };
        if let Some(message) = quality_breach {
            self.trip(StopReason::QualityFloor, message);
        }
    }

    /// Feed one failed task into the rolling signals.
    pub fn record_failure(&self) {
        {
            let mut signals = self.signals.lock();
            push_bounded(&mut signals.outcomes, false, self.thresholds.failure_window);
        }
        if let Some(message) = self.failure_rate_breach() {
            self.trip(StopReason::FailureRate, message);
        }
    }

    /// A model-selection budget refusal: counts as a failure and halts the run.
    pub fn record_budget_refusal(&self, message: impl Into<String>) {
        self.record_failure();
        self.trip(StopReason::BudgetExhausted, message);
    }

    /// Explicit operator stop
    pub fn request_stop(&self, message: impl Into<String>) -> StopState {
        self.trip(StopReason::Operator, message)
    }

    /// Count one in-flight operation until the guard drops.
    pub fn operation_started(&self) -> OperationGuard {
        let now = self.active_operations.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = OperationGuard {
            counter: Arc::clone(&self.active_operations),
        };
        if now > self.thresholds.max_concurrent_operations {
            self.trip(
                StopReason::ConcurrencyCeiling,
                format!(
                    "{} concurrent operations exceed ceiling {}",
                    now, self.thresholds.max_concurrent_operations
                ),
            );
        }
        guard
    }

    pub fn active_operations(&self) -> usize {
        self.active_operations.load(Ordering::SeqCst)
    }

    pub fn failure_rate(&self) -> Option<f64> {
        self.signals.lock().failure_rate()
    }

    pub fn rolling_quality(&self) -> Option<f64> {
        self.signals.lock().rolling_quality()
    }

    /// Trip the stop. The first trip wins; later calls return the existing state.
    pub fn trip(&self, reason: StopReason, message: impl Into<String>) -> StopState {
        let _serialize = self.trip_lock.lock();
        if let Some(existing) = self.state.read().clone() {
            return existing;
        }

        let mut state = StopState::new(reason, message);
        match self.persistence.persist_stop_state(&state) {
            Ok(true) => {}
            Ok(false) => {
                // Another process halted first; adopt its state.
                if let Ok(Some(persisted)) = self.persistence.load_stop_state() {
                    state = persisted;
                }
            }
            Err(e) => {
                error!(
                    target: "glossgen::alert",
                    error = %e,
                    "Failed to persist stop state; halting this process only"
                );
            }
        }

        *self.state.write() = Some(state.clone());
        self.tripped.store(true, Ordering::SeqCst);
        error!(
            target: "glossgen::alert",
            reason = %state.reason,
            message = %state.message,
            tripped_at = %state.tripped_at.to_rfc3339(),
            "Emergency stop tripped"
        );
        state
    }

    /// Operator acknowledgment: clear the persisted state, the stop-request
    /// file and the in-memory signals so a resumed run may proceed.
    pub fn acknowledge(&self) -> Result<bool, StorageError> {
        let _serialize = self.trip_lock.lock();
        let cleared = self.persistence.clear_stop_state()?;
        if let Some(path) = &self.stop_file {
            remove_stop_request(path)?;
        }
        *self.state.write() = None;
        *self.signals.lock() = Signals::default();
        self.tripped.store(false, Ordering::SeqCst);
        info!(cleared, "Stop state acknowledged");
        Ok(cleared)
    }

    fn pending_stop_request(&self) -> Option<String> {
        let path = self.stop_file.as_ref()?;
        if !path.exists() {
            return None;
        }
        let text = fs::read_to_string(path).unwrap_or_default();
        let text = text.trim();
        Some(if text.is_empty() {
            "operator stop request".to_string()
        } else {
            text.to_string()
        })
    }

    fn failure_rate_breach(&self) -> Option<String> {
        let signals = self.signals.lock();
        if signals.outcomes.len() < self.thresholds.min_failure_samples.max(1) {
            return None;
        }
        let rate = signals.failure_rate()?;
        (rate > self.thresholds.max_failure_rate).then(|| {
            format!(
                "failure rate {:.1}% over last {} tasks exceeds {:.1}%",
                rate * 100.0,
                signals.outcomes.len(),
                self.thresholds.max_failure_rate * 100.0
            )
        })
    }
}

/// Keeps the concurrent-operation count raised while alive
pub struct OperationGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, capacity: usize) {
    queue.push_back(value);
    while queue.len() > capacity.max(1) {
        queue.pop_front();
    }
}

/// File an operator stop request at `path`.
pub fn write_stop_request(path: &Path, reason: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, reason)
}

/// Remove a pending stop request; a missing file is not an error.
pub fn remove_stop_request(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
