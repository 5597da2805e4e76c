use std::fs;
use std::path::{Path, PathBuf};

use agent_ledger_cli::{error_envelope, execute, Cli, INVALID_INPUT_CODE, NOT_FOUND_CODE};
use clap::Parser;
use serde_json::{json, Value};

struct Workspace {
    _dir: tempfile::TempDir,
    db: PathBuf,
    journal_dir: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir()
            .unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        let db = dir.path().join("ledger.sqlite3");
        let journal_dir = dir.path().join("logs");
        Self {
            _dir: dir,
            db,
            journal_dir,
        }
    }

    fn cli(&self, args: &[&str]) -> Cli {
        let mut argv = vec![
            "ledger".to_string(),
            "--db".to_string(),
            self.db.display().to_string(),
            "--journal-dir".to_string(),
            self.journal_dir.display().to_string(),
            "--network".to_string(),
            "base-sepolia".to_string(),
        ];
        argv.extend(args.iter().map(ToString::to_string));
        Cli::try_parse_from(argv).unwrap_or_else(|err| panic!("failed to parse {args:?}: {err}"))
    }

    fn run(&self, args: &[&str]) -> Value {
        execute(self.cli(args)).unwrap_or_else(|err| panic!("command {args:?} failed: {err:#}"))
    }

    fn run_err(&self, args: &[&str]) -> anyhow::Error {
        match execute(self.cli(args)) {
            Ok(value) => panic!("command {args:?} unexpectedly succeeded: {value}"),
            Err(err) => err,
        }
    }

    fn journal_lines(&self, file: &str) -> Vec<Value> {
        read_lines(&self.journal_dir.join(file))
    }
}

fn read_lines(path: &Path) -> Vec<Value> {
    let raw = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    raw.lines()
        .map(|line| {
            serde_json::from_str(line).unwrap_or_else(|err| panic!("bad journal line: {err}"))
        })
        .collect()
}

#[test]
fn init_reports_schema_version() {
    let workspace = Workspace::new();
    let output = workspace.run(&["init"]);
    assert_eq!(output["schema_version"], json!(1));
}

#[test]
fn logged_operation_appears_in_history_and_journal() {
    let workspace = Workspace::new();
    let logged = workspace.run(&[
        "op",
        "log",
        "--wallet",
        "0xAB",
        "--type",
        "transfer",
        "--status",
        "success",
        "--amount",
        "0.1",
        "--tx-hash",
        "0xfeed",
        "--details-json",
        r#"{"asset":"eth"}"#,
    ]);
    assert_eq!(logged["network"], json!("base-sepolia"));

    let history = workspace.run(&["history", "--wallet", "0xAB", "--limit", "1"]);
    assert_eq!(history, json!([logged]));
    assert_eq!(history[0]["amount"], json!(0.1));
    assert_eq!(history[0]["details"], json!({"asset": "eth"}));

    let lines = workspace.journal_lines("transactions.log");
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["id"], logged["id"]);
}

#[test]
fn rejected_operation_maps_to_invalid_input_envelope() {
    let workspace = Workspace::new();
    let err = workspace.run_err(&[
        "op", "log", "--wallet", " ", "--type", "transfer", "--status", "success",
    ]);
    let envelope = error_envelope(&err).unwrap_or_else(|| panic!("expected envelope for {err}"));
    assert_eq!(envelope["code"], json!(INVALID_INPUT_CODE));
    assert!(!workspace.journal_dir.join("transactions.log").exists());
}

#[test]
fn agent_events_are_listed_most_recent_first() {
    let workspace = Workspace::new();
    workspace.run(&[
        "event",
        "log",
        "--type",
        "wallet_created",
        "--wallet",
        "0xAB",
        "--details-json",
        r#"{"network":"base-sepolia"}"#,
    ]);
    workspace.run(&[
        "event",
        "log",
        "--type",
        "agent_initialized",
        "--wallet",
        "0xAB",
        "--status",
        "ready",
    ]);

    let events = workspace.run(&["events", "--wallet", "0xAB"]);
    let types: Vec<&Value> = events
        .as_array()
        .unwrap_or_else(|| panic!("expected array, got {events}"))
        .iter()
        .map(|event| &event["event_type"])
        .collect();
    assert_eq!(types, vec![&json!("agent_initialized"), &json!("wallet_created")]);

    let filtered = workspace.run(&["events", "--type", "wallet_created"]);
    assert_eq!(filtered.as_array().map(Vec::len), Some(1));
    assert_eq!(workspace.journal_lines("agent_events.log").len(), 2);
}

#[test]
fn missing_wallet_maps_to_not_found_envelope() {
    let workspace = Workspace::new();
    let err = workspace.run_err(&["wallet", "show", "--address", "0xNOPE"]);
    let envelope = error_envelope(&err).unwrap_or_else(|| panic!("expected envelope for {err}"));
    assert_eq!(envelope["code"], json!(NOT_FOUND_CODE));
}

#[test]
fn wallet_upsert_replaces_snapshot() {
    let workspace = Workspace::new();
    let first = workspace.run(&[
        "wallet",
        "upsert",
        "--address",
        "0xAB",
        "--balance-json",
        r#"{"eth":1.0}"#,
        "--tokens-json",
        r#"["0xTOKEN"]"#,
    ]);
    workspace.run(&[
        "wallet",
        "upsert",
        "--address",
        "0xAB",
        "--network",
        "base-mainnet",
        "--balance-json",
        r#"{"eth":2.5}"#,
    ]);

    let shown = workspace.run(&["wallet", "show", "--address", "0xAB"]);
    assert_eq!(shown["balance"], json!({"eth": 2.5}));
    assert_eq!(shown["network"], json!("base-mainnet"));
    assert_eq!(shown["tokens"], json!([]));
    assert_eq!(shown["created_at"], first["created_at"]);
}

#[test]
fn wallet_upsert_rejects_non_array_tokens() {
    let workspace = Workspace::new();
    let err = workspace.run_err(&[
        "wallet",
        "upsert",
        "--address",
        "0xAB",
        "--tokens-json",
        r#"{"not":"a list"}"#,
    ]);
    assert!(err.to_string().contains("tokens_json"));
}

#[test]
fn wallet_import_reads_provider_export() {
    let workspace = Workspace::new();
    let export_path = workspace.journal_dir.with_file_name("wallet_export.json");
    fs::write(
        &export_path,
        r#"{"wallet_id":"w-1","default_address_id":"0xDEF","balance":{"eth":0.5}}"#,
    )
    .unwrap_or_else(|err| panic!("failed to write export: {err}"));

    let imported = workspace.run(&[
        "wallet",
        "import",
        "--file",
        &export_path.display().to_string(),
    ]);
    assert_eq!(imported["address"], json!("0xDEF"));
    assert_eq!(imported["network"], json!("base-sepolia"));
    assert_eq!(imported["metadata"]["wallet_id"], json!("w-1"));
}

#[test]
fn wallet_import_rejects_malformed_export() {
    let workspace = Workspace::new();
    let export_path = workspace.journal_dir.with_file_name("wallet_export.json");
    fs::write(&export_path, "{not json").unwrap_or_else(|err| panic!("failed to write export: {err}"));

    let err = workspace.run_err(&[
        "wallet",
        "import",
        "--file",
        &export_path.display().to_string(),
    ]);
    let envelope = error_envelope(&err).unwrap_or_else(|| panic!("expected envelope for {err}"));
    assert_eq!(envelope["code"], json!(INVALID_INPUT_CODE));
    assert!(err.to_string().contains("wallet_export"));

    let missing = workspace.run_err(&["wallet", "show", "--address", "0xDEF"]);
    assert!(error_envelope(&missing).is_some());
}

#[test]
fn oversized_metric_windows_do_not_abort() {
    let workspace = Workspace::new();
    let stats = workspace.run(&["stats", "--hours", "4294967295"]);
    assert_eq!(stats["total_operations"], json!(0));
    let trends = workspace.run(&["gas-trends", "--days", "5000000"]);
    assert_eq!(trends, json!([]));
}

#[test]
fn metrics_commands_on_empty_ledger_return_zero_defaults() {
    let workspace = Workspace::new();

    let stats = workspace.run(&["stats", "--type", "nonexistent_type"]);
    assert_eq!(stats["total_operations"], json!(0));
    assert_eq!(stats["success_rate"], json!(0.0));
    assert_eq!(stats["error_types"], json!({}));

    let trends = workspace.run(&["gas-trends", "--days", "7"]);
    assert_eq!(trends, json!([]));

    let performance = workspace.run(&["wallet-perf", "--address", "0xAB"]);
    assert_eq!(performance["total_operations"], json!(0));

    let report = workspace.run(&["report"]);
    assert_eq!(report["overall_stats"]["total_operations"], json!(0));
    assert_eq!(report["operation_types"], json!({}));
}
