//! Command workflow through `RunContext` against a real workspace

use crate::integration::with_xdg_env;
use glossgen::cli::{Commands, RunContext, RunRequest};
use glossgen::error::PipelineError;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const TERMS: &str = r#"[
    "merkle-tree",
    { "id": "bloom-filter", "display_name": "Bloom filter" },
    { "id": "raft", "metadata": { "field": "consensus" } }
]"#;

const DIMENSIONS: &str = r#"
[[dimensions]]
id = "definition"
title = "Definition"
complexity = "simple"

[[dimensions]]
id = "tradeoffs"
description = "Costs and benefits in practice"
complexity = "complex"
"#;

fn workspace(root: &Path) {
    fs::create_dir_all(root.join("config")).unwrap();
    fs::write(root.join("terms.json"), TERMS).unwrap();
    fs::write(root.join("dimensions.toml"), DIMENSIONS).unwrap();
    fs::write(
        root.join("config").join("config.toml"),
        r#"
[run]
concurrency = 2
monitor_interval_secs = 1

[provider]
type = "scripted"
"#,
    )
    .unwrap();
}

fn dry_run(resume: bool) -> RunRequest {
    RunRequest {
        resume,
        concurrency: None,
        order: None,
        cancel_in_flight: false,
        ack_stop: false,
        dry_run: true,
        terms: None,
        dimensions: None,
    }
}

#[test]
fn validate_run_status_export_round() {
    let test_dir = TempDir::new().unwrap();
    with_xdg_env(&test_dir, || {
        let root = test_dir.path().join("ws");
        workspace(&root);
        let ctx = RunContext::new(root.clone(), None).unwrap();

        let validation = ctx.execute(&Commands::Validate).unwrap();
        assert!(validation.contains("Tasks: 6"));

        let summary = ctx.handle_run(&dry_run(false)).unwrap();
        assert_eq!(summary.total_tasks, 6);
        assert_eq!(summary.completed, 6);
        assert!(!summary.halted());

        let status = ctx
            .execute(&Commands::Status {
                format: "json".to_string(),
            })
            .unwrap();
        let status: serde_json::Value = serde_json::from_str(&status).unwrap();
        assert_eq!(status["counts"]["done"], 6);
        assert_eq!(status["stop_requested"], false);

        let out = root.join("export").join("glossary.json");
        let message = ctx
            .execute(&Commands::Export {
                out: Some(out.clone()),
            })
            .unwrap();
        assert!(message.contains("Exported 6 result(s)"));
        let exported: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(exported["results"].as_array().unwrap().len(), 6);
    });
}

#[test]
fn stop_request_halts_until_acknowledged() {
    let test_dir = TempDir::new().unwrap();
    with_xdg_env(&test_dir, || {
        let root = test_dir.path().join("ws");
        workspace(&root);
        let ctx = RunContext::new(root.clone(), None).unwrap();

        ctx.execute(&Commands::Stop {
            reason: Some("rotate keys".to_string()),
        })
        .unwrap();

        let summary = ctx.handle_run(&dry_run(false)).unwrap();
        assert!(summary.halted());
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.stop_state.unwrap().message, "rotate keys");

        // The persisted stop refuses a new run outright.
        let refused = ctx.handle_run(&dry_run(true)).unwrap_err();
        assert!(matches!(refused, PipelineError::Halted(_)));
        assert_eq!(glossgen::cli::exit_code(&refused), 3);

        let ack = ctx.execute(&Commands::AckStop).unwrap();
        assert!(ack.contains("rotate keys"));

        let summary = ctx.handle_run(&dry_run(true)).unwrap();
        assert_eq!(summary.completed, 6);
        assert_eq!(summary.remaining, 0);
    });
}

#[test]
fn missing_catalogue_fails_validation() {
    let test_dir = TempDir::new().unwrap();
    with_xdg_env(&test_dir, || {
        let root = test_dir.path().join("ws");
        workspace(&root);
        fs::remove_file(root.join("terms.json")).unwrap();
        let ctx = RunContext::new(root.clone(), None).unwrap();

        let err = ctx.execute(&Commands::Validate).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert_eq!(glossgen::cli::exit_code(&err), 2);
        assert!(err.to_string().contains("terms.json"));
    });
}

#[test]
fn reset_with_confirmation_flag_clears_progress() {
    let test_dir = TempDir::new().unwrap();
    with_xdg_env(&test_dir, || {
        let root = test_dir.path().join("ws");
        workspace(&root);
        let ctx = RunContext::new(root.clone(), None).unwrap();
        ctx.handle_run(&dry_run(false)).unwrap();

        ctx.execute(&Commands::Reset { yes: true }).unwrap();
        let status = ctx
            .execute(&Commands::Status {
                format: "json".to_string(),
            })
            .unwrap();
        let status: serde_json::Value = serde_json::from_str(&status).unwrap();
        assert_eq!(status["counts"]["done"], 0);
    });
}
