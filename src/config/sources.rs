//! File-backed configuration sources.

pub mod global_file;
pub mod workspace_file;
