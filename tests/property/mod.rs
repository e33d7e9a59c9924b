//! Property-based tests for the quality loop and cost accounting

mod accounting;
mod quality_loop;
