//! CLI presentation: text and json formatters per command family.

mod run;
mod shared;
mod status;
mod validate;

pub use run::{format_run_summary_json, format_run_summary_text};
pub use shared::format_section_heading;
pub use status::{format_status_json, format_status_text, StatusReport};
pub use validate::{format_validation_report, ValidationReport};
