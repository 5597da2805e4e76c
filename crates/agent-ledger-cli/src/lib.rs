//! Operator command surface for the agent ledger.
//!
//! Embedders can drive the same behavior the `ledger` binary exposes through:
//! - [`run_cli`] to execute a parsed [`Cli`] and print its JSON result.
//! - [`execute`] to get the JSON result without printing.
//! - [`run_with_db`] to run one [`Command`] against a [`LedgerConfig`].
//! - [`run_command`] against an already opened [`Ledger`].

use std::fs;
use std::path::{Path, PathBuf};

use agent_ledger_audit::{AuditError, AuditLogger};
use agent_ledger_core::{
    parse_wallet_export, AgentEventInput, OperationInput, OperationStatus, WalletSnapshot,
    DEFAULT_EVENT_LIMIT, DEFAULT_GAS_TREND_DAYS, DEFAULT_HISTORY_LIMIT, DEFAULT_NETWORK,
    DEFAULT_STATS_WINDOW_HOURS,
};
use agent_ledger_metrics::{MetricsEngine, MetricsError};
use agent_ledger_store_sqlite::{SqliteLedgerStore, StoreError};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

pub const NOT_FOUND_CODE: &str = "ledger.not_found";
pub const INVALID_INPUT_CODE: &str = "ledger.invalid_input";

#[derive(Debug, Parser)]
#[command(name = "ledger")]
#[command(about = "Operational ledger for an autonomous on-chain agent")]
pub struct Cli {
    #[arg(long, env = "AGENT_LEDGER_DB", default_value = "./agent_ledger.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "AGENT_LEDGER_JOURNAL_DIR", default_value = "./logs")]
    journal_dir: PathBuf,

    #[arg(long, env = "NETWORK_ID", default_value = DEFAULT_NETWORK)]
    network: String,

    /// Log at debug level to stderr.
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    #[must_use]
    pub fn config(&self) -> LedgerConfig {
        LedgerConfig {
            db_path: self.db.clone(),
            journal_dir: self.journal_dir.clone(),
            network: self.network.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the schema and print its version.
    Init,
    Op {
        #[command(subcommand)]
        command: OpCommand,
    },
    Event {
        #[command(subcommand)]
        command: EventCommand,
    },
    History(HistoryArgs),
    Events(EventsArgs),
    Wallet {
        #[command(subcommand)]
        command: WalletCommand,
    },
    Stats(StatsArgs),
    WalletPerf(WalletPerfArgs),
    GasTrends(GasTrendsArgs),
    Report,
}

#[derive(Debug, Subcommand)]
pub enum OpCommand {
    Log(OpLogArgs),
}

#[derive(Debug, Args)]
pub struct OpLogArgs {
    #[arg(long)]
    wallet: String,
    #[arg(long = "type")]
    operation_type: String,
    #[arg(long, value_parser = OperationStatus::parse_input)]
    status: OperationStatus,
    #[arg(long)]
    network: Option<String>,
    #[arg(long)]
    tx_hash: Option<String>,
    #[arg(long)]
    block_number: Option<i64>,
    #[arg(long)]
    gas_used: Option<f64>,
    #[arg(long)]
    amount: Option<f64>,
    #[arg(long)]
    token_address: Option<String>,
    #[arg(long)]
    recipient: Option<String>,
    #[arg(long, default_value = "{}")]
    details_json: String,
    #[arg(long)]
    error_message: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Log(EventLogArgs),
}

#[derive(Debug, Args)]
pub struct EventLogArgs {
    #[arg(long = "type")]
    event_type: String,
    #[arg(long)]
    wallet: String,
    #[arg(long)]
    details_json: Option<String>,
    #[arg(long)]
    status: Option<String>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    wallet: Option<String>,
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    #[arg(long)]
    wallet: Option<String>,
    #[arg(long = "type")]
    event_type: Option<String>,
    #[arg(long, default_value_t = DEFAULT_EVENT_LIMIT)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
pub enum WalletCommand {
    Show(WalletShowArgs),
    Upsert(WalletUpsertArgs),
    /// Import a wallet provider export document.
    Import(WalletImportArgs),
}

#[derive(Debug, Args)]
pub struct WalletShowArgs {
    #[arg(long)]
    address: String,
}

#[derive(Debug, Args)]
pub struct WalletUpsertArgs {
    #[arg(long)]
    address: String,
    #[arg(long)]
    network: Option<String>,
    #[arg(long, default_value = "{}")]
    balance_json: String,
    #[arg(long, default_value = "[]")]
    tokens_json: String,
    #[arg(long, default_value = "{}")]
    metadata_json: String,
}

#[derive(Debug, Args)]
pub struct WalletImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long = "type")]
    operation_type: Option<String>,
    #[arg(long, default_value_t = DEFAULT_STATS_WINDOW_HOURS)]
    hours: u32,
}

#[derive(Debug, Args)]
pub struct WalletPerfArgs {
    #[arg(long)]
    address: String,
}

#[derive(Debug, Args)]
pub struct GasTrendsArgs {
    #[arg(long = "type")]
    operation_type: Option<String>,
    #[arg(long, default_value_t = DEFAULT_GAS_TREND_DAYS)]
    days: u32,
}

/// Resolved runtime settings shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    pub journal_dir: PathBuf,
    pub network: String,
}

/// Opened store plus the audit and metrics components built on it.
#[derive(Debug, Clone)]
pub struct Ledger {
    config: LedgerConfig,
    store: SqliteLedgerStore,
    audit: AuditLogger,
    metrics: MetricsEngine,
}

impl Ledger {
    /// Opens the database, applies migrations, and wires the components.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(config: LedgerConfig) -> Result<Self> {
        let store = SqliteLedgerStore::open(&config.db_path)?;
        store.migrate()?;

        let audit = AuditLogger::new(store.clone(), config.journal_dir.clone());
        let metrics = MetricsEngine::new(store.clone());

        Ok(Self {
            config,
            store,
            audit,
            metrics,
        })
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &SqliteLedgerStore {
        &self.store
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsEngine {
        &self.metrics
    }
}

/// A lookup that matched nothing. Rendered as a stable error envelope.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct NotFound {
    pub message: String,
}

/// Installs the stderr log subscriber. `RUST_LOG` wins unless `verbose` is set.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("agent_ledger=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agent_ledger=info"))
    };

    // A second install (embedders, tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Runs a parsed CLI invocation and prints its JSON result to stdout.
///
/// # Errors
/// Returns an error when opening the ledger or running the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let output = execute(cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// # Errors
/// Returns an error when opening the ledger or running the command fails.
pub fn execute(cli: Cli) -> Result<Value> {
    let config = cli.config();
    run_with_db(config, cli.command)
}

/// Opens (and migrates) the configured database, then runs `command`.
///
/// # Errors
/// Returns an error when opening the ledger or running the command fails.
pub fn run_with_db(config: LedgerConfig, command: Command) -> Result<Value> {
    let ledger = Ledger::open(config)?;
    run_command(command, &ledger)
}

/// # Errors
/// Returns an error for invalid arguments, failed writes, or a missing wallet
/// (as [`NotFound`]).
pub fn run_command(command: Command, ledger: &Ledger) -> Result<Value> {
    match command {
        Command::Init => {
            let version = ledger.store().schema_version()?;
            info!(db = %ledger.config().db_path.display(), ?version, "ledger initialized");
            Ok(json!({
                "db": ledger.config().db_path.display().to_string(),
                "schema_version": version,
            }))
        }
        Command::Op {
            command: OpCommand::Log(args),
        } => {
            let network = args
                .network
                .unwrap_or_else(|| ledger.config().network.clone());
            let mut input =
                OperationInput::new(args.wallet, args.operation_type, network, args.status);
            input.tx_hash = args.tx_hash;
            input.block_number = args.block_number;
            input.gas_used = args.gas_used;
            input.amount = args.amount;
            input.token_address = args.token_address;
            input.recipient_address = args.recipient;
            input.details = parse_document(&args.details_json, "details_json")?;
            input.error_message = args.error_message;

            let record = ledger.audit().log_transaction(&input)?;
            Ok(serde_json::to_value(record)?)
        }
        Command::Event {
            command: EventCommand::Log(args),
        } => {
            let details = args
                .details_json
                .as_deref()
                .map(|raw| parse_document(raw, "details_json"))
                .transpose()?;
            let event = ledger.audit().log_agent_event(&AgentEventInput {
                event_type: args.event_type,
                wallet_address: args.wallet,
                details,
                status: args.status,
            })?;
            Ok(serde_json::to_value(event)?)
        }
        Command::History(args) => {
            let records = ledger
                .audit()
                .query_transaction_history(args.wallet.as_deref(), args.limit)?;
            Ok(serde_json::to_value(records)?)
        }
        Command::Events(args) => {
            let events = ledger.audit().query_agent_events(
                args.wallet.as_deref(),
                args.event_type.as_deref(),
                args.limit,
            )?;
            Ok(serde_json::to_value(events)?)
        }
        Command::Wallet { command } => run_wallet(command, ledger),
        Command::Stats(args) => {
            let stats = ledger
                .metrics()
                .get_operation_stats(args.operation_type.as_deref(), args.hours)?;
            Ok(serde_json::to_value(stats)?)
        }
        Command::WalletPerf(args) => {
            let performance = ledger.metrics().get_wallet_performance(&args.address)?;
            Ok(serde_json::to_value(performance)?)
        }
        Command::GasTrends(args) => {
            let trends = ledger
                .metrics()
                .get_gas_usage_trends(args.operation_type.as_deref(), args.days)?;
            Ok(serde_json::to_value(trends)?)
        }
        Command::Report => {
            let report = ledger.metrics().generate_performance_report()?;
            Ok(serde_json::to_value(report)?)
        }
    }
}

fn run_wallet(command: WalletCommand, ledger: &Ledger) -> Result<Value> {
    match command {
        WalletCommand::Show(args) => match ledger.store().get_wallet(&args.address)? {
            Some(record) => Ok(serde_json::to_value(record)?),
            None => Err(NotFound {
                message: format!("wallet not found: {}", args.address),
            }
            .into()),
        },
        WalletCommand::Upsert(args) => {
            let network = args
                .network
                .unwrap_or_else(|| ledger.config().network.clone());
            let mut snapshot = WalletSnapshot::new(args.address, network);
            snapshot.balance = parse_document(&args.balance_json, "balance_json")?;
            snapshot.tokens = match parse_document(&args.tokens_json, "tokens_json")? {
                Value::Array(items) => items,
                _ => return Err(anyhow!("tokens_json must be a JSON array")),
            };
            snapshot.metadata = parse_document(&args.metadata_json, "metadata_json")?;

            let record = ledger.store().upsert_wallet(&snapshot)?;
            Ok(serde_json::to_value(record)?)
        }
        WalletCommand::Import(args) => {
            let raw = read_export(&args.file)?;
            let export = parse_wallet_export(&raw).map_err(StoreError::from)?;
            let record = ledger
                .store()
                .save_wallet_export(&export, &ledger.config().network)?;
            info!(address = %record.address, file = %args.file.display(), "wallet export imported");
            Ok(serde_json::to_value(record)?)
        }
    }
}

/// Maps a command failure to a stable `{code, message}` envelope when it has
/// one. Other failures are reported as plain text.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Option<Value> {
    let code = if err.downcast_ref::<NotFound>().is_some() {
        NOT_FOUND_CODE
    } else if is_invalid_input(err) {
        INVALID_INPUT_CODE
    } else {
        return None;
    };
    Some(json!({ "code": code, "message": err.to_string() }))
}

fn is_invalid_input(err: &anyhow::Error) -> bool {
    if let Some(store) = err.downcast_ref::<StoreError>() {
        return store.is_validation();
    }
    if let Some(AuditError::Store(store)) = err.downcast_ref::<AuditError>() {
        return store.is_validation();
    }
    if let Some(MetricsError::Store(store)) = err.downcast_ref::<MetricsError>() {
        return store.is_validation();
    }
    false
}

fn parse_document(raw: &str, field: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{field} must be valid JSON: {raw}"))
}

fn read_export(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("failed to read wallet export {}", path.display()))
}
