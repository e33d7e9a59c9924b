//! glossgen: bulk glossary content generation
//!
//! Drives a term x dimension matrix of generation tasks through a
//! generate, evaluate, improve loop against an LLM provider, with durable
//! checkpoints for resume, a shared cost ledger, and an emergency stop that
//! halts the run on cost, failure-rate, quality or operator signals.

pub mod catalog;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod provider;
pub mod scheduler;
pub mod selector;
pub mod stop;
pub mod templates;
pub mod types;
