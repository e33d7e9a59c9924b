//! Checkpoint status for `glossgen status`.

use super::shared::{format_section_heading, format_usd};
use crate::checkpoint::StatusCounts;
use crate::error::PipelineError;
use crate::stop::StopState;
use crate::types::Cost;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub counts: StatusCounts,
    pub spend: Cost,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_state: Option<StopState>,
    /// A `glossgen stop` request not yet observed by a run
    pub stop_requested: bool,
}

pub fn format_status_text(report: &StatusReport) -> String {
    let counts = &report.counts;
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Checkpoint")));
    out.push_str(&format!(
        "  {} of {} cells complete\n",
        counts.done, counts.total
    ));
    if let Some(run) = &report.last_run {
        out.push_str(&format!("  Last run: {}\n", run));
    }
    out.push_str(&format!("  Spend: {}\n\n", format_usd(report.spend.as_usd())));

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Status", "Tasks"]);
    table.add_row(vec!["pending".to_string(), counts.pending.to_string()]);
    table.add_row(vec!["in progress".to_string(), counts.in_progress.to_string()]);
    table.add_row(vec!["done (accepted)".to_string(), counts.completed.to_string()]);
    table.add_row(vec![
        "done (below threshold)".to_string(),
        counts.completed_below_threshold.to_string(),
    ]);
    table.add_row(vec!["failed".to_string(), counts.failed.to_string()]);
    out.push_str(&format!("{}\n", table));

    match &report.stop_state {
        Some(state) => out.push_str(&format!("\n  {} {}\n", "STOPPED:".red().bold(), state)),
        None => out.push_str(&format!("\n  Stop state: {}\n", "clear".green())),
    }
    if report.stop_requested {
        out.push_str(&format!(
            "  {}\n",
            "A stop request is pending; the next check of a running pipeline will halt it.".yellow()
        ));
    }
    out
}

pub fn format_status_json(report: &StatusReport) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(report)
        .map_err(|e| PipelineError::Runtime(format!("Failed to encode status: {}", e)))
}
