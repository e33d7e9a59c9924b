//! CLI help: stable command names for logs.

use crate::cli::parse::Commands;

/// Stable command name for the given command (used in log events).
pub fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Run { .. } => "run",
        Commands::Status { .. } => "status",
        Commands::Export { .. } => "export",
        Commands::Reset { .. } => "reset",
        Commands::Stop { .. } => "stop",
        Commands::AckStop => "ack-stop",
        Commands::Validate => "validate",
    }
}
