//! Shared test utilities for integration tests
//!
//! Provides an isolated config environment and a fully wired pipeline backed
//! by a scripted provider and a temporary checkpoint store.

use glossgen::checkpoint::CheckpointStore;
use glossgen::engine::{EngineConfig, GenerationEngine};
use glossgen::ledger::UsageLedger;
use glossgen::provider::{RetryPolicy, RetryingClient, ScriptedProvider};
use glossgen::scheduler::{RunOptions, Scheduler};
use glossgen::selector::{ModelSelector, ModelsConfig, TierModelConfig};
use glossgen::stop::{EmergencyStopController, StopThresholds};
use glossgen::templates::{DimensionTemplate, TemplateStore};
use glossgen::types::{ComplexityTier, Cost, Task, Term};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Global mutex to serialize environment variable access across all tests
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const ISOLATED_VARS: [&str; 3] = ["HOME", "XDG_CONFIG_HOME", "GLOSSGEN_ENV"];

/// Environment variable state to restore after test
struct EnvState {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvState {
    fn capture() -> Self {
        Self {
            saved: ISOLATED_VARS
                .iter()
                .map(|name| (*name, std::env::var(name).ok()))
                .collect(),
        }
    }

    fn restore(self) {
        for (name, value) in self.saved {
            match value {
                Some(orig) => std::env::set_var(name, orig),
                None => std::env::remove_var(name),
            }
        }
    }
}

/// Run `f` with HOME and XDG_CONFIG_HOME pointed inside `test_dir`, so no
/// global config file of the host leaks into the test.
///
/// The global config file for the test lives at
/// `<test_dir>/glossgen/config.toml`.
pub fn with_xdg_env<F, R>(test_dir: &TempDir, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let env_state = EnvState::capture();

    let test_home = test_dir.path().join("home");
    std::fs::create_dir_all(&test_home).unwrap();

    std::env::set_var("HOME", test_home.to_str().unwrap());
    std::env::set_var("XDG_CONFIG_HOME", test_dir.path().to_str().unwrap());
    std::env::remove_var("GLOSSGEN_ENV");

    let result = f();

    env_state.restore();

    result
}

/// Dimensions every test pipeline knows about
pub const DIMENSIONS: [(&str, ComplexityTier); 2] = [
    ("overview", ComplexityTier::Simple),
    ("history", ComplexityTier::Moderate),
];

/// A scheduler wired to a scripted provider and a temporary store
pub struct Pipeline {
    pub dir: TempDir,
    pub provider: Arc<ScriptedProvider>,
    pub store: CheckpointStore,
    pub ledger: Arc<UsageLedger>,
    pub controller: Arc<EmergencyStopController>,
    pub scheduler: Scheduler,
}

impl Pipeline {
    /// Drop every handle on the store and hand back its directory.
    pub fn into_dir(self) -> TempDir {
        let Pipeline { dir, .. } = self;
        dir
    }
}

pub struct PipelineBuilder {
    provider: ScriptedProvider,
    thresholds: StopThresholds,
    models: ModelsConfig,
    engine: EngineConfig,
    baseline: Cost,
    run_id: String,
    dir: Option<TempDir>,
}

impl PipelineBuilder {
    pub fn new(provider: ScriptedProvider) -> Self {
        Self {
            provider,
            thresholds: StopThresholds::default(),
            models: ModelsConfig::default(),
            engine: EngineConfig::default(),
            baseline: Cost::ZERO,
            run_id: "run-test".to_string(),
            dir: None,
        }
    }

    pub fn thresholds(mut self, thresholds: StopThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn models(mut self, models: ModelsConfig) -> Self {
        self.models = models;
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn baseline(mut self, baseline: Cost) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn run_id(mut self, run_id: &str) -> Self {
        self.run_id = run_id.to_string();
        self
    }

    /// Reuse the checkpoint database of an earlier pipeline.
    pub fn in_dir(mut self, dir: TempDir) -> Self {
        self.dir = Some(dir);
        self
    }

    pub fn build(self) -> Pipeline {
        let dir = match self.dir {
            Some(dir) => dir,
            None => TempDir::new().unwrap(),
        };
        let store = CheckpointStore::open(dir.path().join("checkpoint")).unwrap();
        let provider = Arc::new(self.provider);
        let ledger = Arc::new(UsageLedger::with_baseline(
            self.models.price_table(),
            self.baseline,
        ));
        let client = Arc::new(RetryingClient::new(
            provider.clone(),
            Arc::clone(&ledger),
            fast_retry(),
        ));
        let selector = Arc::new(ModelSelector::new(&self.models, Arc::clone(&ledger), None));
        let templates = Arc::new(
            TemplateStore::from_dimensions(
                DIMENSIONS
                    .iter()
                    .map(|(id, tier)| DimensionTemplate::new(*id, *tier))
                    .collect(),
            )
            .unwrap(),
        );
        let engine = Arc::new(GenerationEngine::new(client, selector, templates, self.engine));
        let controller = Arc::new(
            EmergencyStopController::new(
                self.thresholds,
                Arc::clone(&ledger),
                Arc::new(store.clone()),
            )
            .unwrap(),
        );
        let scheduler = Scheduler::new(
            engine,
            store.clone(),
            Arc::clone(&controller),
            Arc::clone(&ledger),
        )
        .with_run_id(self.run_id);
        Pipeline {
            dir,
            provider,
            store,
            ledger,
            controller,
            scheduler,
        }
    }
}

/// Retries with millisecond backoff so failure paths stay fast
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 4,
        jitter: 0.0,
        ..RetryPolicy::default()
    }
}

/// Every tier priced at one cent per token, so one scripted call
/// (100 prompt + 50 completion tokens) costs $1.50.
pub fn cent_per_token_models() -> ModelsConfig {
    let tier = |model: &str| TierModelConfig {
        model: model.to_string(),
        input_usd_per_million: 10_000.0,
        output_usd_per_million: 10_000.0,
        fallback: None,
    };
    ModelsConfig {
        simple: tier("test-small"),
        moderate: tier("test-medium"),
        complex: tier("test-large"),
        ..ModelsConfig::default()
    }
}

/// Tasks for `terms` across the given dimensions, term-major.
pub fn tasks_for(terms: &[&str], dimensions: &[(&str, ComplexityTier)]) -> Vec<Task> {
    terms
        .iter()
        .flat_map(|t| {
            let term = Arc::new(Term::new(*t));
            dimensions.iter().map(move |(d, tier)| Task {
                term: Arc::clone(&term),
                dimension_id: d.to_string(),
                complexity: *tier,
            })
        })
        .collect()
}

/// Tasks for `terms` across both test dimensions.
pub fn tasks(terms: &[&str]) -> Vec<Task> {
    tasks_for(terms, &DIMENSIONS)
}

pub fn run_options(concurrency: usize, resume: bool) -> RunOptions {
    RunOptions {
        concurrency,
        resume,
        monitor_interval: Duration::from_millis(20),
        ..RunOptions::default()
    }
}
