//! Run summary formatting.

use super::shared::{format_optional_score, format_section_heading, format_usd};
use crate::error::PipelineError;
use crate::scheduler::RunSummary;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;

pub fn format_run_summary_text(summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Run summary")));
    out.push_str(&format!("  Run: {}\n", summary.run_id));
    out.push_str(&format!(
        "  {} of {} cells complete\n\n",
        summary.finished() + summary.skipped_done,
        summary.total_tasks
    ));

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Outcome", "Tasks"]);
    let rows = [
        ("Accepted", summary.completed),
        ("Below threshold", summary.completed_below_threshold),
        ("Failed", summary.failed),
        ("Cancelled", summary.cancelled),
        ("Skipped (done)", summary.skipped_done),
        ("Skipped (failed)", summary.skipped_failed),
        ("Claim conflicts", summary.claim_conflicts),
        ("Remaining", summary.remaining),
    ];
    for (label, count) in rows {
        table.add_row(vec![label.to_string(), count.to_string()]);
    }
    out.push_str(&format!("{}\n\n", table));

    out.push_str(&format!(
        "  Run cost: {}  (total incl. earlier runs: {})\n",
        format_usd(summary.run_cost.as_usd()),
        format_usd(summary.total_cost.as_usd())
    ));
    out.push_str(&format!(
        "  Average score: {}\n",
        format_optional_score(summary.average_score)
    ));
    out.push_str(&format!(
        "  Elapsed: {:.1}s\n",
        summary.elapsed_ms as f64 / 1000.0
    ));
    if summary.storage_errors > 0 {
        out.push_str(&format!(
            "  {}\n",
            format!("Storage errors: {}", summary.storage_errors).yellow()
        ));
    }
    if let Some(state) = &summary.stop_state {
        out.push_str(&format!(
            "\n  {} {}\n  Run `glossgen ack-stop` after addressing the cause, then `glossgen run --resume`.\n",
            "HALTED:".red().bold(),
            state
        ));
    }
    out
}

pub fn format_run_summary_json(summary: &RunSummary) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(summary)
        .map_err(|e| PipelineError::Runtime(format!("Failed to encode run summary: {}", e)))
}
