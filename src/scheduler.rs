//! Worker pool: dispatches pending tasks to concurrent workers, claiming each
//! through the checkpoint store and consulting the emergency stop before every
//! dispatch.

use crate::checkpoint::{now_millis, CheckpointStore, ClaimOutcome, TaskStatus};
use crate::engine::{FailureKind, GenerationEngine, ResultStatus, TaskOutcome};
use crate::error::PipelineError;
use crate::ledger::UsageLedger;
use crate::stop::{EmergencyStopController, StopReason, StopState, StopStatePersistence};
use crate::types::{Cost, Task};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happens to in-flight tasks once a stop trips
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Let in-flight tasks run to completion
    #[default]
    Drain,
    /// Cancel in-flight tasks and return them to `pending`
    Cancel,
}

impl FromStr for InFlightPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drain" => Ok(InFlightPolicy::Drain),
            "cancel" => Ok(InFlightPolicy::Cancel),
            other => Err(format!(
                "unknown in-flight policy '{}'; expected drain or cancel",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    pub resume: bool,
    pub in_flight: InFlightPolicy,
    /// Age after which another run's `in_progress` claim may be taken over
    pub staleness: Duration,
    pub monitor_interval: Duration,
    pub retry_failed_on_resume: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 25,
            resume: false,
            in_flight: InFlightPolicy::Drain,
            staleness: Duration::from_secs(1800),
            monitor_interval: Duration::from_secs(5),
            retry_failed_on_resume: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total_tasks: usize,
    pub skipped_done: usize,
    pub skipped_failed: usize,
    pub attempted: usize,
    pub completed: usize,
    pub completed_below_threshold: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub claim_conflicts: usize,
    pub storage_errors: usize,
    /// Tasks still pending when the run ended
    pub remaining: usize,
    pub run_cost: Cost,
    pub total_cost: Cost,
    pub average_score: Option<f64>,
    pub elapsed_ms: u64,
    pub halt_reason: Option<StopReason>,
    pub stop_state: Option<StopState>,
}

impl RunSummary {
    pub fn finished(&self) -> usize {
        self.completed + self.completed_below_threshold
    }

    pub fn halted(&self) -> bool {
        self.stop_state.is_some()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} tasks complete ({} below threshold, {} failed, {} cancelled), cost {}",
            self.finished(),
            self.total_tasks,
            self.completed_below_threshold,
            self.failed,
            self.cancelled,
            self.run_cost
        )?;
        if let Some(state) = &self.stop_state {
            write!(f, "; halted: {}", state)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Tally {
    skipped_done: usize,
    skipped_failed: usize,
    attempted: usize,
    completed: usize,
    completed_below_threshold: usize,
    failed: usize,
    cancelled: usize,
    claim_conflicts: usize,
    storage_errors: usize,
    in_flight: usize,
    score_sum: u64,
    score_count: u64,
    halted_by_store: bool,
}

impl Tally {
    fn average_score(&self) -> Option<f64> {
        (self.score_count > 0).then(|| self.score_sum as f64 / self.score_count as f64)
    }
}

struct WorkerContext {
    run_id: String,
    engine: Arc<GenerationEngine>,
    store: CheckpointStore,
    controller: Arc<EmergencyStopController>,
    ledger: Arc<UsageLedger>,
    queue: Mutex<VecDeque<Task>>,
    tally: Mutex<Tally>,
    cancel: CancellationToken,
    in_flight: InFlightPolicy,
    staleness: Duration,
}

impl WorkerContext {
    /// Consult the stop controller; true when dispatching must end.
    fn halted(&self) -> bool {
        if self.controller.check().is_none() {
            return false;
        }
        if self.in_flight == InFlightPolicy::Cancel {
            self.cancel.cancel();
        }
        true
    }
}

/// Fresh run identifier; doubles as the checkpoint claim owner.
pub fn new_run_id() -> String {
    format!("run-{}-{}", now_millis(), std::process::id())
}

pub struct Scheduler {
    engine: Arc<GenerationEngine>,
    store: CheckpointStore,
    controller: Arc<EmergencyStopController>,
    ledger: Arc<UsageLedger>,
    run_id: String,
}

impl Scheduler {
    pub fn new(
        engine: Arc<GenerationEngine>,
        store: CheckpointStore,
        controller: Arc<EmergencyStopController>,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        Self {
            engine,
            store,
            controller,
            ledger,
            run_id: new_run_id(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn controller(&self) -> &Arc<EmergencyStopController> {
        &self.controller
    }

    /// Process `tasks` with a bounded worker pool until the queue drains or
    /// the emergency stop trips.
    pub async fn run(&self, tasks: Vec<Task>, options: RunOptions) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let concurrency = options.concurrency.max(1);
        let total_tasks = tasks.len();

        if !options.resume {
            self.store.reset()?;
        }
        self.store.set_last_run(&self.run_id)?;
        self.store.seed(&tasks)?;
        if options.resume {
            self.store
                .prepare_resume(&self.run_id, options.retry_failed_on_resume)?;
        }

        let mut tally = Tally::default();
        let mut queue = VecDeque::with_capacity(tasks.len());
        for task in tasks {
            match self.store.record(&task.key())?.map(|r| r.status) {
                Some(TaskStatus::Done) => tally.skipped_done += 1,
                Some(TaskStatus::Failed) => tally.skipped_failed += 1,
                _ => queue.push_back(task),
            }
        }

        info!(
            run_id = %self.run_id,
            total_tasks,
            queued = queue.len(),
            skipped_done = tally.skipped_done,
            skipped_failed = tally.skipped_failed,
            concurrency,
            resume = options.resume,
            "Starting generation run"
        );

        let ctx = Arc::new(WorkerContext {
            run_id: self.run_id.clone(),
            engine: Arc::clone(&self.engine),
            store: self.store.clone(),
            controller: Arc::clone(&self.controller),
            ledger: Arc::clone(&self.ledger),
            queue: Mutex::new(queue),
            tally: Mutex::new(tally),
            cancel: CancellationToken::new(),
            in_flight: options.in_flight,
            staleness: options.staleness,
        });

        let monitor_done = CancellationToken::new();
        let monitor = tokio::spawn(Self::monitor_loop(
            Arc::clone(&ctx),
            options.monitor_interval,
            monitor_done.clone(),
        ));

        let mut workers: FuturesUnordered<_> = (0..concurrency)
            .map(|worker_id| tokio::spawn(Self::worker_loop(worker_id, Arc::clone(&ctx))))
            .collect();
        while let Some(joined) = workers.next().await {
            if let Err(e) = joined {
                error!(run_id = %self.run_id, error = %e, "Worker task aborted");
            }
        }

        monitor_done.cancel();
        if let Err(e) = monitor.await {
            warn!(error = %e, "Monitor task aborted");
        }

        self.store.persist_spend(self.ledger.total_cost())?;
        self.store.flush()?;

        let stop_state = match self.controller.state() {
            Some(state) => Some(state),
            None if ctx.tally.lock().halted_by_store => self.store.load_stop_state()?,
            None => None,
        };
        let remaining = self.store.counts()?.pending;
        let tally = ctx.tally.lock();
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            total_tasks,
            skipped_done: tally.skipped_done,
            skipped_failed: tally.skipped_failed,
            attempted: tally.attempted,
            completed: tally.completed,
            completed_below_threshold: tally.completed_below_threshold,
            failed: tally.failed,
            cancelled: tally.cancelled,
            claim_conflicts: tally.claim_conflicts,
            storage_errors: tally.storage_errors,
            remaining,
            run_cost: self.ledger.run_cost(),
            total_cost: self.ledger.total_cost(),
            average_score: tally.average_score(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            halt_reason: stop_state.as_ref().map(|s| s.reason),
            stop_state,
        };

        info!(
            run_id = %summary.run_id,
            completed = summary.completed,
            below_threshold = summary.completed_below_threshold,
            failed = summary.failed,
            cancelled = summary.cancelled,
            remaining = summary.remaining,
            cost_usd = summary.run_cost.as_usd(),
            elapsed_ms = summary.elapsed_ms,
            halt_reason = ?summary.halt_reason,
            "Generation run finished"
        );
        Ok(summary)
    }

    async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>) {
        debug!(worker_id, "Worker started");

        loop {
            if ctx.halted() {
                debug!(worker_id, "Stop observed; no further claims");
                break;
            }
            let Some(task) = ctx.queue.lock().pop_front() else {
                break;
            };
            let key = task.key();

            match ctx.store.claim(&key, &ctx.run_id, ctx.staleness) {
                Ok(ClaimOutcome::Claimed(record)) => {
                    debug!(worker_id, task = %key, attempt = record.attempts, "Claimed task");
                }
                Ok(ClaimOutcome::Halted) => {
                    ctx.tally.lock().halted_by_store = true;
                    if ctx.in_flight == InFlightPolicy::Cancel {
                        ctx.cancel.cancel();
                    }
                    info!(worker_id, "Persisted stop state refused claim");
                    break;
                }
                Ok(ClaimOutcome::AlreadyClaimed { owner }) => {
                    ctx.tally.lock().claim_conflicts += 1;
                    debug!(worker_id, task = %key, owner = ?owner, "Task claimed elsewhere");
                    continue;
                }
                Ok(ClaimOutcome::AlreadyDone) => {
                    ctx.tally.lock().skipped_done += 1;
                    continue;
                }
                Ok(ClaimOutcome::PreviouslyFailed) => {
                    ctx.tally.lock().skipped_failed += 1;
                    continue;
                }
                Ok(ClaimOutcome::Missing) => {
                    warn!(worker_id, task = %key, "Task has no checkpoint record");
                    continue;
                }
                Err(e) => {
                    ctx.tally.lock().storage_errors += 1;
                    error!(worker_id, task = %key, error = %e, "Claim failed");
                    continue;
                }
            }

            {
                let mut tally = ctx.tally.lock();
                tally.attempted += 1;
                tally.in_flight += 1;
            }
            let outcome = {
                let _operation = ctx.controller.operation_started();
                ctx.engine.process(&task, &ctx.cancel).await
            };
            ctx.tally.lock().in_flight -= 1;

            match outcome {
                TaskOutcome::Cancelled => {
                    ctx.tally.lock().cancelled += 1;
                    match ctx.store.release(&key, &ctx.run_id) {
                        Ok(_) => debug!(worker_id, task = %key, "Released cancelled task"),
                        Err(e) => {
                            ctx.tally.lock().storage_errors += 1;
                            error!(worker_id, task = %key, error = %e, "Failed to release cancelled task");
                        }
                    }
                }
                TaskOutcome::Finished(result) => {
                    if let Err(e) = ctx.store.complete(&key, &ctx.run_id, &result) {
                        // The claim stays in_progress and is reclaimed on resume.
                        ctx.tally.lock().storage_errors += 1;
                        error!(worker_id, task = %key, error = %e, "Failed to checkpoint result");
                        ctx.controller.record_failure();
                        continue;
                    }

                    match result.status {
                        ResultStatus::Completed | ResultStatus::CompletedBelowThreshold => {
                            {
                                let mut tally = ctx.tally.lock();
                                if result.status == ResultStatus::Completed {
                                    tally.completed += 1;
                                } else {
                                    tally.completed_below_threshold += 1;
                                }
                                if let Some(score) = result.score {
                                    tally.score_sum += u64::from(score);
                                    tally.score_count += 1;
                                }
                            }
                            ctx.controller.record_completion(result.score);
                        }
                        ResultStatus::Failed => {
                            ctx.tally.lock().failed += 1;
                            match &result.error {
                                Some(detail) if detail.kind == FailureKind::Budget => {
                                    ctx.controller.record_budget_refusal(detail.message.clone())
                                }
                                _ => ctx.controller.record_failure(),
                            }
                        }
                    }

                    if let Err(e) = ctx.store.persist_spend(ctx.ledger.total_cost()) {
                        warn!(worker_id, error = %e, "Failed to persist spend");
                    }
                }
            }
        }

        debug!(worker_id, "Worker stopped");
    }

    async fn monitor_loop(ctx: Arc<WorkerContext>, interval: Duration, done: CancellationToken) {
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = sleep(interval) => {}
            }
            // Tripping here also cancels in-flight work under the cancel policy.
            let stopped = ctx.halted();
            let (completed, below, failed, in_flight) = {
                let tally = ctx.tally.lock();
                (
                    tally.completed,
                    tally.completed_below_threshold,
                    tally.failed,
                    tally.in_flight,
                )
            };
            info!(
                run_id = %ctx.run_id,
                completed,
                below_threshold = below,
                failed,
                in_flight,
                queued = ctx.queue.lock().len(),
                cost_usd = ctx.ledger.total_cost().as_usd(),
                rolling_quality = ?ctx.controller.rolling_quality(),
                stopped,
                "Run progress"
            );
        }
    }
}
