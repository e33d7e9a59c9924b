//! Operator CLI: argument parsing, command routing, help, output and presentation.

mod help;
mod output;
mod parse;
mod presentation;
mod route;

pub use help::command_name;
pub use output::{exit_code, map_error};
pub use parse::{Cli, Commands};
pub use presentation::{
    format_run_summary_json, format_run_summary_text, format_section_heading,
    format_status_json, format_status_text, format_validation_report, StatusReport,
    ValidationReport,
};
pub use route::{RunContext, RunRequest};
