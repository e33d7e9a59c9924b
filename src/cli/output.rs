//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::PipelineError;

/// Map domain/service errors to a string for CLI output.
pub fn map_error(e: &PipelineError) -> String {
    match e {
        PipelineError::Halted(msg) => format!("Run halted: {}", msg),
        other => other.to_string(),
    }
}

/// Process exit code for a failed command
pub fn exit_code(e: &PipelineError) -> i32 {
    match e {
        PipelineError::Config(_) => 2,
        PipelineError::Halted(_) => 3,
        _ => 1,
    }
}
