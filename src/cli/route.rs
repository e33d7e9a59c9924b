//! CLI route: single route table and run context. Dispatches to domain services and presentation.

use crate::catalog::{task_matrix, TermCatalog};
use crate::checkpoint::{export_results, CheckpointStore};
use crate::cli::help::command_name;
use crate::cli::parse::Commands;
use crate::cli::presentation::{
    format_run_summary_json, format_run_summary_text, format_status_json, format_status_text,
    format_validation_report, StatusReport, ValidationReport,
};
use crate::config::{resolve_path, ConfigLoader, PipelineConfig};
use crate::engine::GenerationEngine;
use crate::error::PipelineError;
use crate::ledger::UsageLedger;
use crate::provider::{
    ModelProviderClient, ProviderFactory, ProviderType, RetryingClient, ScriptedProvider,
};
use crate::scheduler::{InFlightPolicy, RunSummary, Scheduler};
use crate::selector::ModelSelector;
use crate::stop::{
    remove_stop_request, write_stop_request, EmergencyStopController, StopStatePersistence,
};
use crate::templates::TemplateStore;
use crate::types::{Cost, Task};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Options of `glossgen run`, detached from clap types
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub resume: bool,
    pub concurrency: Option<usize>,
    pub order: Option<crate::catalog::TraversalOrder>,
    pub cancel_in_flight: bool,
    pub ack_stop: bool,
    pub dry_run: bool,
    pub terms: Option<PathBuf>,
    pub dimensions: Option<PathBuf>,
}

/// Runtime context for CLI execution: workspace root and loaded configuration.
pub struct RunContext {
    workspace_root: PathBuf,
    config: PipelineConfig,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, PipelineError> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        Ok(Self::with_config(workspace_root, config))
    }

    pub fn with_config(workspace_root: PathBuf, config: PipelineConfig) -> Self {
        Self {
            workspace_root,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String, PipelineError> {
        let started = Instant::now();
        let result = match command {
            Commands::Run {
                resume,
                concurrency,
                order,
                cancel_in_flight,
                ack_stop,
                dry_run,
                terms,
                dimensions,
                format,
            } => {
                let request = RunRequest {
                    resume: *resume,
                    concurrency: *concurrency,
                    order: *order,
                    cancel_in_flight: *cancel_in_flight,
                    ack_stop: *ack_stop,
                    dry_run: *dry_run,
                    terms: terms.clone(),
                    dimensions: dimensions.clone(),
                };
                self.handle_run(&request).and_then(|summary| match format.as_str() {
                    "json" => format_run_summary_json(&summary),
                    _ => Ok(format_run_summary_text(&summary)),
                })
            }
            Commands::Status { format } => self.handle_status(format),
            Commands::Export { out } => self.handle_export(out.as_deref()),
            Commands::Reset { yes } => self.handle_reset(*yes),
            Commands::Stop { reason } => self.handle_stop(reason.as_deref()),
            Commands::AckStop => self.handle_ack_stop(),
            Commands::Validate => self.handle_validate(),
        };
        info!(
            command = command_name(command),
            ok = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        result
    }

    /// Build the pipeline and run it to completion or halt.
    pub fn handle_run(&self, request: &RunRequest) -> Result<RunSummary, PipelineError> {
        let mut config = self.config.clone();
        if let Some(concurrency) = request.concurrency {
            config.run.concurrency = concurrency;
        }
        if let Some(order) = request.order {
            config.run.order = order;
        }
        if request.cancel_in_flight {
            config.run.in_flight = InFlightPolicy::Cancel;
        }
        if request.dry_run {
            config.provider.provider_type = ProviderType::Scripted;
        }
        if let Some(path) = &request.terms {
            config.catalog.terms_path = path.clone();
        }
        if let Some(path) = &request.dimensions {
            config.catalog.dimensions_path = path.clone();
        }
        config.validate().map_err(|errors| {
            let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            PipelineError::Config(format!(
                "Configuration validation failed:\n{}",
                msgs.join("\n")
            ))
        })?;

        let (tasks, templates) = self.load_matrix(&config)?;
        let store = self.open_store()?;
        let stop_file = config.system.storage.stop_file_path(&self.workspace_root);

        if request.ack_stop {
            acknowledge(&store, &stop_file)?;
        }

        let prices = if request.dry_run {
            config.models.free_price_table()
        } else {
            config.models.price_table()
        };
        let baseline = if request.resume {
            store.load_spend()?
        } else {
            Cost::ZERO
        };
        let ledger = Arc::new(UsageLedger::with_baseline(prices, baseline));

        let provider: Arc<dyn ModelProviderClient> = if request.dry_run {
            Arc::new(ScriptedProvider::dry_run())
        } else {
            ProviderFactory::create_client(&config.provider)?
        };
        let client = Arc::new(RetryingClient::new(
            provider,
            Arc::clone(&ledger),
            config.retry.clone(),
        ));
        let selector = Arc::new(ModelSelector::new(
            &config.models,
            Arc::clone(&ledger),
            Some(config.safety.cost_ceiling()),
        ));
        let engine = Arc::new(GenerationEngine::new(
            client,
            selector,
            Arc::new(templates),
            config.run.engine_config(&config.provider),
        ));
        let controller = Arc::new(
            EmergencyStopController::new(
                config.safety.clone(),
                Arc::clone(&ledger),
                Arc::new(store.clone()),
            )?
            .with_stop_file(&stop_file),
        );
        if let Some(state) = controller.state() {
            return Err(PipelineError::Halted(format!(
                "{}; run `glossgen ack-stop` or pass --ack-stop once the cause is addressed",
                state
            )));
        }

        let scheduler = Scheduler::new(engine, store, Arc::clone(&controller), ledger);
        let options = config.run.run_options(request.resume);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| PipelineError::Runtime(format!("Failed to start async runtime: {}", e)))?;
        runtime.block_on(async {
            let interrupt = {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupt received; requesting stop");
                        controller.request_stop("interrupted by operator");
                    }
                })
            };
            let summary = scheduler.run(tasks, options).await;
            interrupt.abort();
            summary
        })
    }

    fn handle_status(&self, format: &str) -> Result<String, PipelineError> {
        let checkpoint = self.config.system.storage.checkpoint_path(&self.workspace_root);
        if !checkpoint.exists() {
            return Ok(format!(
                "No checkpoint at {}. Run `glossgen run` first.",
                checkpoint.display()
            ));
        }
        let store = self.open_store()?;
        let report = StatusReport {
            counts: store.counts()?,
            spend: store.load_spend()?,
            last_run: store.last_run()?,
            stop_state: store.load_stop_state()?,
            stop_requested: self
                .config
                .system
                .storage
                .stop_file_path(&self.workspace_root)
                .exists(),
        };
        match format {
            "json" => format_status_json(&report),
            _ => Ok(format_status_text(&report)),
        }
    }

    fn handle_export(&self, out: Option<&Path>) -> Result<String, PipelineError> {
        let store = self.open_store()?;
        let path = match out {
            Some(path) => resolve_path(&self.workspace_root, path),
            None => self
                .config
                .system
                .storage
                .default_export_path(&self.workspace_root),
        };
        let summary = export_results(&store, &path)?;
        Ok(format!(
            "Exported {} result(s) ({} below threshold, {} failed skipped) to {}",
            summary.exported,
            summary.below_threshold,
            summary.skipped_failed,
            summary.path.display()
        ))
    }

    fn handle_reset(&self, yes: bool) -> Result<String, PipelineError> {
        if !yes {
            use dialoguer::Confirm;
            let confirmed = Confirm::new()
                .with_prompt("Clear all checkpoint progress and generated results?")
                .default(false)
                .interact()
                .map_err(|e| PipelineError::Runtime(format!("Failed to get user input: {}", e)))?;
            if !confirmed {
                return Ok("Reset cancelled".to_string());
            }
        }
        let store = self.open_store()?;
        store.reset()?;
        store.flush()?;
        let note = if store.load_stop_state()?.is_some() {
            " A persisted stop state remains; clear it with `glossgen ack-stop`."
        } else {
            ""
        };
        Ok(format!("Checkpoint reset.{}", note))
    }

    fn handle_stop(&self, reason: Option<&str>) -> Result<String, PipelineError> {
        let path = self.config.system.storage.stop_file_path(&self.workspace_root);
        let reason = reason.unwrap_or("operator stop request");
        write_stop_request(&path, reason).map_err(crate::error::StorageError::from)?;
        Ok(format!(
            "Stop requested ({}). A running pipeline halts on its next check.",
            reason
        ))
    }

    fn handle_ack_stop(&self) -> Result<String, PipelineError> {
        let store = self.open_store()?;
        let stop_file = self.config.system.storage.stop_file_path(&self.workspace_root);
        let previous = store.load_stop_state()?;
        acknowledge(&store, &stop_file)?;
        Ok(match previous {
            Some(state) => format!("Acknowledged stop ({}). Resume with `glossgen run --resume`.", state),
            None => "No stop state was set.".to_string(),
        })
    }

    fn handle_validate(&self) -> Result<String, PipelineError> {
        let mut report = ValidationReport::default();
        if let Err(errors) = self.config.validate() {
            report.problems.extend(errors.iter().map(|e| e.to_string()));
        }
        let terms_path = resolve_path(&self.workspace_root, &self.config.catalog.terms_path);
        match TermCatalog::load_from_file(&terms_path) {
            Ok(catalog) => {
                if catalog.is_empty() {
                    report.problems.push(format!("{}: no terms", terms_path.display()));
                }
                report.terms = Some(catalog.len());
            }
            Err(e) => report.problems.push(format!("{}: {}", terms_path.display(), e)),
        }
        let dimensions_path =
            resolve_path(&self.workspace_root, &self.config.catalog.dimensions_path);
        match TemplateStore::load_from_file(&dimensions_path) {
            Ok(templates) => {
                if templates.is_empty() {
                    report
                        .problems
                        .push(format!("{}: no dimensions", dimensions_path.display()));
                }
                report.dimensions = Some(templates.len());
            }
            Err(e) => report
                .problems
                .push(format!("{}: {}", dimensions_path.display(), e)),
        }

        let text = format_validation_report(&report);
        if report.is_valid() {
            Ok(text)
        } else {
            Err(PipelineError::Config(text))
        }
    }

    fn load_matrix(&self, config: &PipelineConfig) -> Result<(Vec<Task>, TemplateStore), PipelineError> {
        let catalog =
            TermCatalog::load_from_file(&resolve_path(&self.workspace_root, &config.catalog.terms_path))?;
        let templates = TemplateStore::load_from_file(&resolve_path(
            &self.workspace_root,
            &config.catalog.dimensions_path,
        ))?;
        let tasks = task_matrix(&catalog, &templates, config.run.order);
        if tasks.is_empty() {
            return Err(PipelineError::Config(
                "The term x dimension matrix is empty; nothing to generate".to_string(),
            ));
        }
        info!(
            terms = catalog.len(),
            dimensions = templates.len(),
            tasks = tasks.len(),
            order = ?config.run.order,
            "Loaded task matrix"
        );
        Ok((tasks, templates))
    }

    fn open_store(&self) -> Result<CheckpointStore, PipelineError> {
        let state_dir = self.config.system.storage.state_dir_in(&self.workspace_root);
        std::fs::create_dir_all(&state_dir).map_err(crate::error::StorageError::from)?;
        Ok(CheckpointStore::open(
            self.config.system.storage.checkpoint_path(&self.workspace_root),
        )?)
    }
}

fn acknowledge(store: &CheckpointStore, stop_file: &Path) -> Result<(), PipelineError> {
    let cleared = store.clear_stop_state()?;
    remove_stop_request(stop_file).map_err(crate::error::StorageError::from)?;
    info!(cleared, "Emergency stop acknowledged");
    Ok(())
}
