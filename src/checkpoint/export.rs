//! Export of finished results for the content-serving layer.

use super::CheckpointStore;
use crate::engine::{GenerationResult, ResultStatus};
use crate::error::StorageError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub exported: usize,
    pub below_threshold: usize,
    pub skipped_failed: usize,
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    exported_at: DateTime<Utc>,
    count: usize,
    results: Vec<&'a GenerationResult>,
}

/// Write every completed result (accepted or below threshold) to `path` as
/// JSON. The file is written beside the target and renamed into place, so a
/// reader never sees a partial export.
pub fn export_results(store: &CheckpointStore, path: &Path) -> Result<ExportSummary, StorageError> {
    let all = store.results()?;
    let exported: Vec<&GenerationResult> = all.values().filter(|r| r.is_done()).collect();
    let below_threshold = exported
        .iter()
        .filter(|r| r.status == ResultStatus::CompletedBelowThreshold)
        .count();
    let skipped_failed = all.len() - exported.len();

    let document = ExportDocument {
        exported_at: Utc::now(),
        count: exported.len(),
        results: exported,
    };
    let body = serde_json::to_vec_pretty(&document)
        .map_err(|e| StorageError::Serialization(format!("Failed to encode export: {}", e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| {
            StorageError::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Export path has no file name: {}", path.display()),
            ))
        })?
        .to_string_lossy()
        .into_owned();
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;

    let summary = ExportSummary {
        path: path.to_path_buf(),
        exported: document.count,
        below_threshold,
        skipped_failed,
    };
    info!(
        path = %path.display(),
        exported = summary.exported,
        below_threshold = summary.below_threshold,
        skipped_failed = summary.skipped_failed,
        "Exported generation results"
    );
    Ok(summary)
}
