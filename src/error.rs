//! Error types for the glossgen content generation pipeline.

use crate::provider::TokenUsage;
use crate::types::{ComplexityTier, Cost, TaskKey};
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checkpoint record not found: {0}")]
    RecordNotFound(TaskKey),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

/// Errors returned by an LLM provider call.
///
/// Classification into transient (retried) and permanent (fail the task) is
/// owned here so the retry wrapper and the engine agree on it.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Provider request timed out: {0}")]
    Timeout(String),

    #[error("Provider rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Provider server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Provider connection failed: {0}")]
    Connection(String),

    #[error("Provider returned a too-short completion ({chars} chars)")]
    EmptyCompletion { chars: usize, usage: TokenUsage },

    #[error("Provider authentication failed: {0}")]
    AuthFailed(String),

    #[error("Provider rejected the request: {0}")]
    InvalidRequest(String),

    #[error("Provider model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider content policy rejection: {message}")]
    ContentFiltered {
        message: String,
        usage: Option<TokenUsage>,
    },

    #[error("Provider response could not be decoded: {0}")]
    MalformedResponse(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Whether the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::RateLimited(_)
            | ProviderError::ServerError { .. }
            | ProviderError::Connection(_)
            | ProviderError::EmptyCompletion { .. }
            | ProviderError::MalformedResponse(_) => true,
            ProviderError::AuthFailed(_)
            | ProviderError::InvalidRequest(_)
            | ProviderError::ModelNotFound(_)
            | ProviderError::ContentFiltered { .. }
            | ProviderError::NotConfigured(_) => false,
        }
    }

    /// Tokens the provider billed even though the call failed.
    pub fn billed_usage(&self) -> Option<&TokenUsage> {
        match self {
            ProviderError::EmptyCompletion { usage, .. } => Some(usage),
            ProviderError::ContentFiltered { usage, .. } => usage.as_ref(),
            _ => None,
        }
    }
}

/// Prompt template errors
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Duplicate dimension id: {0}")]
    DuplicateDimension(String),

    #[error("Dimension '{dimension}': {message}")]
    InvalidTemplate { dimension: String, message: String },

    #[error("Unknown dimension: {0}")]
    UnknownDimension(String),

    #[error("Failed to read dimension catalogue: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse dimension catalogue: {0}")]
    Parse(String),
}

/// Term catalogue errors
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read term catalogue: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse term catalogue: {0}")]
    Parse(String),

    #[error("Duplicate term id: {0}")]
    DuplicateTerm(String),

    #[error("Invalid identifier {0:?}: control characters are not allowed")]
    InvalidIdentifier(String),
}

/// Model selection errors
#[derive(Debug, Clone, Error)]
pub enum SelectionError {
    #[error("Budget exceeded for {tier} tier: projected {projected}, remaining {remaining}")]
    BudgetExceeded {
        tier: ComplexityTier,
        projected: Cost,
        remaining: Cost,
    },

    #[error("No model configured for {0} tier")]
    NoModel(ComplexityTier),
}

/// Top-level pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Model selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Run halted: {0}")]
    Halted(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}
