//! Configuration System
//!
//! Layered run configuration: built-in defaults, the global file, the
//! workspace files and finally `GLOSSGEN__SECTION__KEY` environment
//! variables. Every table has serde defaults, so an empty file is valid.

use crate::catalog::TraversalOrder;
use crate::engine::EngineConfig;
use crate::error::PipelineError;
use crate::logging::LoggingConfig;
use crate::provider::{ProviderConfig, ProviderType, RetryPolicy};
use crate::scheduler::{InFlightPolicy, RunOptions};
use crate::selector::ModelsConfig;
use crate::stop::{StopThresholds, STOP_FILE_NAME};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod merge;
mod sources;

/// Prefix of environment overrides, e.g. `GLOSSGEN__RUN__CONCURRENCY=8`
pub const ENV_PREFIX: &str = "GLOSSGEN";
pub const ENV_SEPARATOR: &str = "__";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub safety: StopThresholds,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[run]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub concurrency: usize,
    /// Minimum evaluator score (1..=10) for a draft to be accepted
    pub acceptance_threshold: u8,
    pub max_improvement_iterations: u32,
    /// Wall-clock budget for one task's whole quality loop
    pub task_timeout_secs: u64,
    pub order: TraversalOrder,
    pub in_flight: InFlightPolicy,
    pub claim_staleness_secs: u64,
    pub monitor_interval_secs: u64,
    pub retry_failed_on_resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 25,
            acceptance_threshold: 7,
            max_improvement_iterations: 2,
            task_timeout_secs: 600,
            order: TraversalOrder::TopDown,
            in_flight: InFlightPolicy::Drain,
            claim_staleness_secs: 1800,
            monitor_interval_secs: 5,
            retry_failed_on_resume: true,
        }
    }
}

impl RunConfig {
    pub fn engine_config(&self, provider: &ProviderConfig) -> EngineConfig {
        EngineConfig {
            acceptance_threshold: self.acceptance_threshold,
            max_improvement_iterations: self.max_improvement_iterations,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            completion: provider.completion_options(),
        }
    }

    pub fn run_options(&self, resume: bool) -> RunOptions {
        RunOptions {
            concurrency: self.concurrency,
            resume,
            in_flight: self.in_flight,
            staleness: Duration::from_secs(self.claim_staleness_secs),
            monitor_interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
            retry_failed_on_resume: self.retry_failed_on_resume,
        }
    }
}

/// `[catalog]` table: where the term and dimension catalogues live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub terms_path: PathBuf,
    pub dimensions_path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            terms_path: PathBuf::from("terms.json"),
            dimensions_path: PathBuf::from("dimensions.toml"),
        }
    }
}

/// System-wide configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[system.storage]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the checkpoint database, stop requests and exports
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".glossgen"),
        }
    }
}

impl StorageConfig {
    pub fn state_dir_in(&self, workspace_root: &Path) -> PathBuf {
        resolve_path(workspace_root, &self.state_dir)
    }

    pub fn checkpoint_path(&self, workspace_root: &Path) -> PathBuf {
        self.state_dir_in(workspace_root).join("checkpoint")
    }

    pub fn stop_file_path(&self, workspace_root: &Path) -> PathBuf {
        self.state_dir_in(workspace_root).join(STOP_FILE_NAME)
    }

    pub fn default_export_path(&self, workspace_root: &Path) -> PathBuf {
        self.state_dir_in(workspace_root).join("results.json")
    }
}

/// Join `path` onto `root` unless it is already absolute.
pub fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Run(String),
    Retry(String),
    Safety(String),
    Provider(String),
    Models(String),
    System(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Run(msg) => write!(f, "run: {}", msg),
            ValidationError::Retry(msg) => write!(f, "retry: {}", msg),
            ValidationError::Safety(msg) => write!(f, "safety: {}", msg),
            ValidationError::Provider(msg) => write!(f, "provider: {}", msg),
            ValidationError::Models(msg) => write!(f, "models: {}", msg),
            ValidationError::System(msg) => write!(f, "system: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl PipelineConfig {
    /// Validate the entire configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let run = &self.run;
        if !(1..=10).contains(&run.acceptance_threshold) {
            errors.push(ValidationError::Run(format!(
                "acceptance_threshold must be within 1..=10, got {}",
                run.acceptance_threshold
            )));
        }
        if run.concurrency == 0 {
            errors.push(ValidationError::Run("concurrency must be at least 1".to_string()));
        }
        if run.concurrency > self.safety.max_concurrent_operations {
            errors.push(ValidationError::Run(format!(
                "concurrency {} exceeds safety.max_concurrent_operations {}",
                run.concurrency, self.safety.max_concurrent_operations
            )));
        }
        if run.task_timeout_secs == 0 {
            errors.push(ValidationError::Run("task_timeout_secs must be positive".to_string()));
        }

        let retry = &self.retry;
        if retry.multiplier < 1.0 {
            errors.push(ValidationError::Retry(format!(
                "multiplier must be at least 1.0, got {}",
                retry.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            errors.push(ValidationError::Retry(format!(
                "jitter must be within 0..=1, got {}",
                retry.jitter
            )));
        }
        if retry.call_timeout_secs == 0 {
            errors.push(ValidationError::Retry("call_timeout_secs must be positive".to_string()));
        }

        let safety = &self.safety;
        if !(safety.max_total_cost_usd >= 0.0) {
            errors.push(ValidationError::Safety(
                "max_total_cost_usd must be non-negative".to_string(),
            ));
        }
        if !(safety.max_failure_rate > 0.0 && safety.max_failure_rate <= 1.0) {
            errors.push(ValidationError::Safety(format!(
                "max_failure_rate must be within (0, 1], got {}",
                safety.max_failure_rate
            )));
        }
        if safety.failure_window == 0 || safety.quality_window == 0 {
            errors.push(ValidationError::Safety(
                "failure_window and quality_window must be at least 1".to_string(),
            ));
        }
        if safety.min_failure_samples > safety.failure_window {
            errors.push(ValidationError::Safety(format!(
                "min_failure_samples {} exceeds failure_window {}",
                safety.min_failure_samples, safety.failure_window
            )));
        }
        if !(0.0..=10.0).contains(&safety.min_rolling_quality) {
            errors.push(ValidationError::Safety(format!(
                "min_rolling_quality must be within 0..=10, got {}",
                safety.min_rolling_quality
            )));
        }

        for tier in crate::types::ComplexityTier::ALL {
            let model = self.models.tier(tier);
            if model.model.trim().is_empty() {
                errors.push(ValidationError::Models(format!("{} tier has an empty model id", tier)));
            }
            if model.input_usd_per_million < 0.0 || model.output_usd_per_million < 0.0 {
                errors.push(ValidationError::Models(format!(
                    "{} tier rates must be non-negative",
                    tier
                )));
            }
            if model.fallback.as_deref().is_some_and(|f| f.trim().is_empty()) {
                errors.push(ValidationError::Models(format!(
                    "{} tier has an empty fallback model id",
                    tier
                )));
            }
        }

        if self.provider.provider_type != ProviderType::Scripted
            && self.provider.resolve_api_key().is_none()
        {
            errors.push(ValidationError::Provider(format!(
                "no API key for {}; set provider.api_key or {}",
                self.provider.provider_type.as_str(),
                ProviderConfig::API_KEY_ENV
            )));
        }
        if let Some(url) = &self.provider.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(ValidationError::Provider(format!(
                    "base_url must be an http(s) URL, got '{}'",
                    url
                )));
            }
        }

        if self.system.storage.state_dir.as_os_str().is_empty() {
            errors.push(ValidationError::System("storage.state_dir cannot be empty".to_string()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads [`PipelineConfig`] from its layered sources
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, then the global file, then workspace files, then environment.
    pub fn load(workspace_root: &Path) -> Result<PipelineConfig, PipelineError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let config = builder.add_source(Self::environment()).build()?;
        Ok(config.try_deserialize()?)
    }

    /// Defaults, then exactly one explicit file, then environment.
    pub fn load_from_file(path: &Path) -> Result<PipelineConfig, PipelineError> {
        let config = merge::merge_policy::builder_with_defaults()?
            .add_source(File::from(path).required(true))
            .add_source(Self::environment())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse one TOML document with no other layers.
    pub fn from_toml_str(raw: &str) -> Result<PipelineConfig, PipelineError> {
        let config = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Path of the global config file, if a home directory can be found
    pub fn xdg_config_path() -> Option<PathBuf> {
        sources::global_file::global_config_path()
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
    }
}
