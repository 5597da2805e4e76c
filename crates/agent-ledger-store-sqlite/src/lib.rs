//! `SQLite` record store for agent operations, wallet snapshots, metric
//! samples, and agent lifecycle events.
//!
//! A [`SqliteLedgerStore`] is a cheap, cloneable handle around one
//! connection. Every public call takes the connection lock, runs to
//! completion (writes inside a single `BEGIN IMMEDIATE` transaction), and
//! releases it before returning, so no call can observe another call's
//! partial work.

#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use agent_ledger_core::{
    format_timestamp, now_utc, parse_timestamp, window_start, AgentEvent, AgentEventInput,
    MetricSample, MetricSampleInput, OperationInput, OperationRecord, OperationStatus,
    ValidationError, WalletRecord, WalletSnapshot,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

pub const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS operations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TEXT NOT NULL,
  wallet_address TEXT NOT NULL CHECK (length(trim(wallet_address)) > 0),
  operation_type TEXT NOT NULL CHECK (length(trim(operation_type)) > 0),
  network TEXT NOT NULL CHECK (length(trim(network)) > 0),
  status TEXT NOT NULL CHECK (status IN ('pending', 'success', 'failed')),
  tx_hash TEXT,
  block_number INTEGER CHECK (block_number >= 0 OR block_number IS NULL),
  gas_used REAL CHECK (gas_used >= 0.0 OR gas_used IS NULL),
  amount REAL CHECK (amount >= 0.0 OR amount IS NULL),
  token_address TEXT,
  recipient_address TEXT,
  details TEXT NOT NULL DEFAULT '{}',
  error_message TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_operations_no_update
BEFORE UPDATE ON operations
BEGIN
  SELECT RAISE(FAIL, 'operations is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_operations_no_delete
BEFORE DELETE ON operations
BEGIN
  SELECT RAISE(FAIL, 'operations is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_operations_timestamp
  ON operations(timestamp, id);
CREATE INDEX IF NOT EXISTS idx_operations_wallet_timestamp
  ON operations(wallet_address, timestamp, id);

CREATE TABLE IF NOT EXISTS wallets (
  address TEXT PRIMARY KEY CHECK (length(trim(address)) > 0),
  network TEXT NOT NULL,
  created_at TEXT NOT NULL,
  last_active TEXT NOT NULL,
  balance TEXT NOT NULL DEFAULT '{}',
  tokens TEXT NOT NULL DEFAULT '[]',
  metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS metric_samples (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TEXT NOT NULL,
  operation_type TEXT NOT NULL,
  wallet_address TEXT NOT NULL,
  duration_ms REAL NOT NULL CHECK (duration_ms >= 0.0),
  success INTEGER NOT NULL CHECK (success IN (0, 1)),
  error_kind TEXT,
  gas_used REAL CHECK (gas_used >= 0.0 OR gas_used IS NULL),
  details TEXT NOT NULL DEFAULT '{}'
);

CREATE TRIGGER IF NOT EXISTS trg_metric_samples_no_update
BEFORE UPDATE ON metric_samples
BEGIN
  SELECT RAISE(FAIL, 'metric_samples is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_metric_samples_no_delete
BEFORE DELETE ON metric_samples
BEGIN
  SELECT RAISE(FAIL, 'metric_samples is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_metric_samples_timestamp
  ON metric_samples(timestamp);
CREATE INDEX IF NOT EXISTS idx_metric_samples_type_timestamp
  ON metric_samples(operation_type, timestamp);
CREATE INDEX IF NOT EXISTS idx_metric_samples_wallet_timestamp
  ON metric_samples(wallet_address, timestamp);

CREATE TABLE IF NOT EXISTS agent_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (length(trim(event_type)) > 0),
  wallet_address TEXT NOT NULL CHECK (length(trim(wallet_address)) > 0),
  details TEXT,
  status TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_agent_events_no_update
BEFORE UPDATE ON agent_events
BEGIN
  SELECT RAISE(FAIL, 'agent_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_agent_events_no_delete
BEFORE DELETE ON agent_events
BEGIN
  SELECT RAISE(FAIL, 'agent_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_agent_events_type_timestamp
  ON agent_events(event_type, timestamp, id);
CREATE INDEX IF NOT EXISTS idx_agent_events_wallet_timestamp
  ON agent_events(wallet_address, timestamp, id);
";

const OPERATION_COLUMNS: &str = "id, timestamp, wallet_address, operation_type, network, status,
    tx_hash, block_number, gas_used, amount, token_address, recipient_address,
    details, error_message";

const WALLET_COLUMNS: &str =
    "address, network, created_at, last_active, balance, tokens, metadata";

const SAMPLE_COLUMNS: &str = "id, timestamp, operation_type, wallet_address, duration_ms,
    success, error_kind, gas_used, details";

const EVENT_COLUMNS: &str = "id, timestamp, event_type, wallet_address, details, status";

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("persistence error: {context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl StoreError {
    pub fn persistence(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Persistence {
            context: context.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Attaches a persistence context to storage-engine failures.
pub trait PersistContext<T> {
    fn persist(self, context: &str) -> StoreResult<T>;
}

impl<T> PersistContext<T> for Result<T, rusqlite::Error> {
    fn persist(self, context: &str) -> StoreResult<T> {
        self.map_err(|err| StoreError::persistence(context, err))
    }
}

impl<T> PersistContext<T> for Result<T, serde_json::Error> {
    fn persist(self, context: &str) -> StoreResult<T> {
        self.map_err(|err| StoreError::persistence(context, err))
    }
}

#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedgerStore").finish_non_exhaustive()
    }
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .persist(&format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .persist("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Creates every table, trigger, and index if absent. Safe to run on
    /// every process start.
    pub fn migrate(&self) -> StoreResult<()> {
        let applied_at = format_timestamp(now_utc())?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .persist("failed to start migration transaction")?;

        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .persist("failed to ensure schema_migrations exists")?;

        tx.execute_batch(SCHEMA_LEDGER_V1)
            .persist("failed to apply ledger schema")?;

        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![LEDGER_MIGRATION_VERSION, applied_at],
        )
        .persist("failed to register ledger schema migration")?;

        tx.commit().persist("failed to commit migration")?;
        debug!(version = LEDGER_MIGRATION_VERSION, "ledger schema ready");
        Ok(())
    }

    pub fn schema_version(&self) -> StoreResult<Option<i64>> {
        let conn = self.lock()?;
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .persist("failed to read schema version")
    }

    /// Appends one operation and returns it with its assigned sequence id
    /// and store-assigned timestamp.
    pub fn insert_operation(&self, input: &OperationInput) -> StoreResult<OperationRecord> {
        input.validate()?;

        let details =
            serde_json::to_string(&input.details).persist("failed to serialize operation details")?;
        let timestamp = now_utc();
        let stamp = format_timestamp(timestamp)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .persist("failed to start operation transaction")?;

        tx.execute(
            "INSERT INTO operations(
                timestamp, wallet_address, operation_type, network, status,
                tx_hash, block_number, gas_used, amount,
                token_address, recipient_address, details, error_message
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13
             )",
            params![
                stamp,
                input.wallet_address,
                input.operation_type,
                input.network,
                input.status.as_str(),
                input.tx_hash,
                input.block_number,
                input.gas_used,
                input.amount,
                input.token_address,
                input.recipient_address,
                details,
                input.error_message,
            ],
        )
        .persist("failed to insert operation")?;

        let id = tx.last_insert_rowid();
        tx.commit().persist("failed to commit operation transaction")?;
        drop(conn);

        debug!(
            id,
            wallet = %input.wallet_address,
            operation_type = %input.operation_type,
            status = %input.status,
            "operation recorded"
        );
        Ok(OperationRecord::from_input(id, timestamp, input))
    }

    /// Writes a full wallet snapshot, replacing network, balance, tokens, and
    /// metadata of any existing row. `created_at` is kept from the first
    /// write; `last_active` is set to now.
    pub fn upsert_wallet(&self, snapshot: &WalletSnapshot) -> StoreResult<WalletRecord> {
        snapshot.validate()?;

        let balance =
            serde_json::to_string(&snapshot.balance).persist("failed to serialize wallet balance")?;
        let tokens =
            serde_json::to_string(&snapshot.tokens).persist("failed to serialize wallet tokens")?;
        let metadata = serde_json::to_string(&snapshot.metadata)
            .persist("failed to serialize wallet metadata")?;
        let now = format_timestamp(now_utc())?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .persist("failed to start wallet transaction")?;

        tx.execute(
            "INSERT INTO wallets(address, network, created_at, last_active, balance, tokens, metadata)
             VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6)
             ON CONFLICT(address) DO UPDATE SET
               network = excluded.network,
               last_active = excluded.last_active,
               balance = excluded.balance,
               tokens = excluded.tokens,
               metadata = excluded.metadata",
            params![snapshot.address, snapshot.network, now, balance, tokens, metadata],
        )
        .persist("failed to upsert wallet")?;

        let record = tx
            .query_row(
                &format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE address = ?1"),
                params![snapshot.address],
                parse_wallet_row,
            )
            .persist("failed to read back upserted wallet")?;

        tx.commit().persist("failed to commit wallet transaction")?;
        drop(conn);

        debug!(address = %record.address, network = %record.network, "wallet snapshot stored");
        Ok(record)
    }

    /// Imports a wallet provider export document through [`Self::upsert_wallet`].
    pub fn save_wallet_export(
        &self,
        export: &Value,
        default_network: &str,
    ) -> StoreResult<WalletRecord> {
        let snapshot = WalletSnapshot::from_export(export, default_network)?;
        self.upsert_wallet(&snapshot)
    }

    pub fn get_wallet(&self, address: &str) -> StoreResult<Option<WalletRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE address = ?1"),
            params![address],
            parse_wallet_row,
        )
        .optional()
        .persist("failed to load wallet")
    }

    pub fn record_metric_sample(&self, input: &MetricSampleInput) -> StoreResult<MetricSample> {
        input.validate()?;

        let details =
            serde_json::to_string(&input.details).persist("failed to serialize sample details")?;
        let timestamp = now_utc();
        let stamp = format_timestamp(timestamp)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .persist("failed to start sample transaction")?;

        tx.execute(
            "INSERT INTO metric_samples(
                timestamp, operation_type, wallet_address, duration_ms,
                success, error_kind, gas_used, details
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                stamp,
                input.operation_type,
                input.wallet_address,
                input.duration_ms,
                bool_to_sql(input.success),
                input.error_kind,
                input.gas_used,
                details,
            ],
        )
        .persist("failed to insert metric sample")?;

        let id = tx.last_insert_rowid();
        tx.commit().persist("failed to commit sample transaction")?;
        drop(conn);

        debug!(
            id,
            operation_type = %input.operation_type,
            success = input.success,
            duration_ms = input.duration_ms,
            "metric sample recorded"
        );

        Ok(MetricSample {
            id,
            timestamp,
            operation_type: input.operation_type.clone(),
            wallet_address: input.wallet_address.clone(),
            duration_ms: input.duration_ms,
            success: input.success,
            error_kind: input.error_kind.clone(),
            gas_used: input.gas_used,
            details: input.details.clone(),
        })
    }

    pub fn insert_agent_event(&self, input: &AgentEventInput) -> StoreResult<AgentEvent> {
        input.validate()?;

        let details = input
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .persist("failed to serialize agent event details")?;
        let timestamp = now_utc();
        let stamp = format_timestamp(timestamp)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .persist("failed to start agent event transaction")?;

        tx.execute(
            "INSERT INTO agent_events(timestamp, event_type, wallet_address, details, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                stamp,
                input.event_type,
                input.wallet_address,
                details,
                input.status
            ],
        )
        .persist("failed to insert agent event")?;

        let id = tx.last_insert_rowid();
        tx.commit().persist("failed to commit agent event transaction")?;
        drop(conn);

        debug!(id, event_type = %input.event_type, wallet = %input.wallet_address, "agent event recorded");

        Ok(AgentEvent {
            id,
            timestamp,
            event_type: input.event_type.clone(),
            wallet_address: input.wallet_address.clone(),
            details: input.details.clone(),
            status: input.status.clone(),
        })
    }

    /// Most recent operations first, optionally for one wallet, at most
    /// `limit` rows.
    pub fn query_operations(
        &self,
        wallet_address: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<OperationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {OPERATION_COLUMNS}
                 FROM operations
                 WHERE (?1 IS NULL OR wallet_address = ?1)
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2"
            ))
            .persist("failed to prepare operation history query")?;

        let rows = stmt
            .query_map(params![wallet_address, sql_limit(limit)], parse_operation_row)
            .persist("failed to query operation history")?;
        collect_rows(rows, "failed to decode operation row")
    }

    pub fn query_agent_events(
        &self,
        wallet_address: Option<&str>,
        event_type: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<AgentEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS}
                 FROM agent_events
                 WHERE (?1 IS NULL OR wallet_address = ?1)
                   AND (?2 IS NULL OR event_type = ?2)
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?3"
            ))
            .persist("failed to prepare agent event query")?;

        let rows = stmt
            .query_map(
                params![wallet_address, event_type, sql_limit(limit)],
                parse_event_row,
            )
            .persist("failed to query agent events")?;
        collect_rows(rows, "failed to decode agent event row")
    }

    /// Every sample recorded within the trailing `window_hours`, optionally
    /// for one operation type.
    pub fn query_metric_samples(
        &self,
        operation_type: Option<&str>,
        window_hours: u32,
    ) -> StoreResult<Vec<MetricSample>> {
        self.query_samples(operation_type, None, window_hours)
    }

    pub fn query_wallet_metric_samples(
        &self,
        wallet_address: &str,
        window_hours: u32,
    ) -> StoreResult<Vec<MetricSample>> {
        self.query_samples(None, Some(wallet_address), window_hours)
    }

    /// Distinct operation types sampled within the trailing window, sorted.
    pub fn operation_types_since(&self, window_hours: u32) -> StoreResult<Vec<String>> {
        let now = now_utc();
        let from = format_timestamp(window_start(now, window_hours))?;
        let to = format_timestamp(now)?;

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT operation_type
                 FROM metric_samples
                 WHERE timestamp >= ?1 AND timestamp <= ?2
                 ORDER BY operation_type ASC",
            )
            .persist("failed to prepare operation type query")?;

        let rows = stmt
            .query_map(params![from, to], |row| row.get::<_, String>(0))
            .persist("failed to query operation types")?;
        collect_rows(rows, "failed to decode operation type row")
    }

    fn query_samples(
        &self,
        operation_type: Option<&str>,
        wallet_address: Option<&str>,
        window_hours: u32,
    ) -> StoreResult<Vec<MetricSample>> {
        let now = now_utc();
        let from = format_timestamp(window_start(now, window_hours))?;
        let to = format_timestamp(now)?;

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SAMPLE_COLUMNS}
                 FROM metric_samples
                 WHERE timestamp >= ?1 AND timestamp <= ?2
                   AND (?3 IS NULL OR operation_type = ?3)
                   AND (?4 IS NULL OR wallet_address = ?4)
                 ORDER BY id ASC"
            ))
            .persist("failed to prepare metric sample query")?;

        let rows = stmt
            .query_map(
                params![from, to, operation_type, wallet_address],
                parse_sample_row,
            )
            .persist("failed to query metric samples")?;
        collect_rows(rows, "failed to decode metric sample row")
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|err| {
            StoreError::persistence(
                "sqlite connection lock poisoned",
                std::io::Error::other(err.to_string()),
            )
        })
    }

    #[cfg(test)]
    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> T) -> T {
        let conn = match self.lock() {
            Ok(conn) => conn,
            Err(err) => panic!("test failure: {err}"),
        };
        op(&conn)
    }
}

fn parse_operation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationRecord> {
    let status_raw: String = row.get(5)?;
    let status = OperationStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(5, Type::Text, format!("invalid status: {status_raw}")))?;

    Ok(OperationRecord {
        id: row.get(0)?,
        timestamp: parse_timestamp_column(row, 1)?,
        wallet_address: row.get(2)?,
        operation_type: row.get(3)?,
        network: row.get(4)?,
        status,
        tx_hash: row.get(6)?,
        block_number: row.get(7)?,
        gas_used: row.get(8)?,
        amount: row.get(9)?,
        token_address: row.get(10)?,
        recipient_address: row.get(11)?,
        details: parse_json_column(row, 12)?,
        error_message: row.get(13)?,
    })
}

fn parse_wallet_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalletRecord> {
    let tokens = match parse_json_column(row, 5)? {
        Value::Array(items) => items,
        other => {
            return Err(invalid_column(
                5,
                Type::Text,
                format!("tokens MUST decode to an array, got {other}"),
            ))
        }
    };

    Ok(WalletRecord {
        address: row.get(0)?,
        network: row.get(1)?,
        created_at: parse_timestamp_column(row, 2)?,
        last_active: parse_timestamp_column(row, 3)?,
        balance: parse_json_column(row, 4)?,
        tokens,
        metadata: parse_json_column(row, 6)?,
    })
}

fn parse_sample_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricSample> {
    Ok(MetricSample {
        id: row.get(0)?,
        timestamp: parse_timestamp_column(row, 1)?,
        operation_type: row.get(2)?,
        wallet_address: row.get(3)?,
        duration_ms: row.get(4)?,
        success: row.get::<_, i64>(5)? == 1,
        error_kind: row.get(6)?,
        gas_used: row.get(7)?,
        details: parse_json_column(row, 8)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentEvent> {
    let details = match row.get::<_, Option<String>>(4)? {
        Some(raw) => Some(decode_json(4, &raw)?),
        None => None,
    };

    Ok(AgentEvent {
        id: row.get(0)?,
        timestamp: parse_timestamp_column(row, 1)?,
        event_type: row.get(2)?,
        wallet_address: row.get(3)?,
        details,
        status: row.get(5)?,
    })
}

fn parse_timestamp_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<time::OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_json_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(index)?;
    decode_json(index, &raw)
}

fn decode_json(index: usize, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw)
        .map_err(|err| invalid_column(index, Type::Text, format!("invalid JSON document: {err}")))
}

fn invalid_column(index: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
    context: &str,
) -> StoreResult<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.persist(context)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use agent_ledger_core::empty_document;
    use proptest::prelude::*;
    use serde_json::json;
    use std::thread;

    fn must<T>(result: StoreResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteLedgerStore {
        let store = must(SqliteLedgerStore::open_in_memory());
        must(store.migrate());
        store
    }

    fn transfer_input() -> OperationInput {
        let mut input =
            OperationInput::new("0xAB", "transfer", "base-sepolia", OperationStatus::Success);
        input.amount = Some(0.1);
        input
    }

    fn sample_input(operation_type: &str, success: bool) -> MetricSampleInput {
        MetricSampleInput {
            operation_type: operation_type.to_string(),
            wallet_address: "0xAB".to_string(),
            duration_ms: 12.5,
            success,
            error_kind: if success {
                None
            } else {
                Some("StoreError".to_string())
            },
            gas_used: None,
            details: empty_document(),
        }
    }

    #[test]
    fn inserted_transfer_comes_back_from_history() {
        let store = fixture_store();
        let inserted = must(store.insert_operation(&transfer_input()));
        assert!(inserted.id >= 1);

        let history = must(store.query_operations(Some("0xAB"), 1));
        assert_eq!(history, vec![inserted.clone()]);
        assert_eq!(history[0].amount, Some(0.1));
        assert_eq!(history[0].status, OperationStatus::Success);
    }

    #[test]
    fn history_is_most_recent_first_and_honors_limit() {
        let store = fixture_store();
        let first = must(store.insert_operation(&transfer_input()));
        let second = must(store.insert_operation(&transfer_input()));
        let mut other = transfer_input();
        other.wallet_address = "0xEF".to_string();
        let third = must(store.insert_operation(&other));

        let all = must(store.query_operations(None, 50));
        let ids: Vec<i64> = all.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);

        let limited = must(store.query_operations(None, 2));
        assert_eq!(limited.len(), 2);

        let none = must(store.query_operations(None, 0));
        assert!(none.is_empty());

        let for_wallet = must(store.query_operations(Some("0xAB"), 50));
        assert_eq!(for_wallet.len(), 2);
        assert!(for_wallet.iter().all(|record| record.wallet_address == "0xAB"));
    }

    #[test]
    fn sequence_ids_are_monotonic() {
        let store = fixture_store();
        let first = must(store.insert_operation(&transfer_input()));
        let second = must(store.insert_operation(&transfer_input()));
        assert!(second.id > first.id);
    }

    #[test]
    fn blank_required_fields_are_rejected_before_write() {
        let store = fixture_store();
        let mut input = transfer_input();
        input.operation_type = String::new();

        let err = store.insert_operation(&input);
        match err {
            Err(StoreError::Validation(inner)) => assert_eq!(inner.field, "operation_type"),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(must(store.query_operations(None, 50)).is_empty());
    }

    #[test]
    fn operations_are_append_only() {
        let store = fixture_store();
        let inserted = must(store.insert_operation(&transfer_input()));

        let update = store.with_connection(|conn| {
            conn.execute(
                "UPDATE operations SET status = 'failed' WHERE id = ?1",
                params![inserted.id],
            )
        });
        assert!(update.is_err());

        let delete = store.with_connection(|conn| {
            conn.execute("DELETE FROM operations WHERE id = ?1", params![inserted.id])
        });
        assert!(delete.is_err());
    }

    #[test]
    fn failed_write_surfaces_persistence_error() {
        let store = must(SqliteLedgerStore::open_in_memory());
        let err = store.insert_operation(&transfer_input());
        assert!(matches!(err, Err(StoreError::Persistence { .. })));
    }

    #[test]
    fn wallet_balance_round_trips() {
        let store = fixture_store();
        let mut snapshot = WalletSnapshot::new("0xAB", "base-sepolia");
        snapshot.balance = json!({"eth": 1.5});

        must(store.upsert_wallet(&snapshot));
        let loaded = match must(store.get_wallet("0xAB")) {
            Some(record) => record,
            None => panic!("expected wallet row"),
        };
        assert_eq!(loaded.balance, json!({"eth": 1.5}));
        assert_eq!(loaded.network, "base-sepolia");
    }

    #[test]
    fn float_documents_round_trip_bit_exact() {
        let store = fixture_store();
        let price: f64 = 1.071_566_039_146_582_6e-75;

        let mut input = transfer_input();
        input.details = json!({ "price": price, "ratios": [0.1, 1e308, 5e-324] });
        must(store.insert_operation(&input));
        let history = must(store.query_operations(Some("0xAB"), 1));
        assert_eq!(history[0].details, input.details);
        assert_eq!(
            history[0].details["price"].as_f64().map(f64::to_bits),
            Some(price.to_bits())
        );

        let mut snapshot = WalletSnapshot::new("0xAB", "base-sepolia");
        snapshot.balance = json!({ "eth": price });
        snapshot.metadata = json!({ "fee_ratio": price * 7.0, "min_positive": f64::MIN_POSITIVE });
        must(store.upsert_wallet(&snapshot));
        let loaded = must(store.get_wallet("0xAB"));
        assert_eq!(loaded.as_ref().map(|record| &record.balance), Some(&snapshot.balance));
        assert_eq!(loaded.map(|record| record.metadata), Some(snapshot.metadata));
    }

    #[test]
    fn missing_wallet_is_none_not_error() {
        let store = fixture_store();
        assert!(must(store.get_wallet("0xNOPE")).is_none());
    }

    #[test]
    fn repeated_upserts_leave_one_row_with_latest_fields() {
        let store = fixture_store();

        let mut first = WalletSnapshot::new("0xAB", "base-sepolia");
        first.balance = json!({"eth": 1.0, "usdc": 10});
        first.tokens = vec![json!("0xTOKEN1")];
        let created = must(store.upsert_wallet(&first));

        let mut second = WalletSnapshot::new("0xAB", "base-mainnet");
        second.balance = json!({"eth": 2.0});
        second.metadata = json!({"provider": "cdp"});
        let updated = must(store.upsert_wallet(&second));

        let rows: i64 = store.with_connection(|conn| {
            match conn.query_row(
                "SELECT COUNT(*) FROM wallets WHERE address = '0xAB'",
                [],
                |row| row.get(0),
            ) {
                Ok(value) => value,
                Err(err) => panic!("test failure: {err}"),
            }
        });
        assert_eq!(rows, 1);

        assert_eq!(updated.network, "base-mainnet");
        assert_eq!(updated.balance, json!({"eth": 2.0}));
        assert!(updated.tokens.is_empty());
        assert_eq!(updated.metadata, json!({"provider": "cdp"}));
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.last_active >= created.last_active);
    }

    #[test]
    fn blank_wallet_address_is_validation_error() {
        let store = fixture_store();
        let err = store.upsert_wallet(&WalletSnapshot::new(" ", "base-sepolia"));
        assert!(matches!(err, Err(StoreError::Validation(_))));
    }

    #[test]
    fn wallet_export_is_imported_with_full_metadata() {
        let store = fixture_store();
        let export = json!({
            "wallet_id": "abc-123",
            "default_address_id": "0xDEF",
            "balance": {"eth": 0.25}
        });

        let record = must(store.save_wallet_export(&export, "base-sepolia"));
        assert_eq!(record.address, "0xDEF");
        assert_eq!(record.balance, json!({"eth": 0.25}));
        assert_eq!(record.metadata, export);
    }

    #[test]
    fn concurrent_upserts_through_cloned_handles_keep_one_row() {
        let store = fixture_store();
        let handles: Vec<_> = (0..8)
            .map(|index| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut snapshot = WalletSnapshot::new("0xAB", "base-sepolia");
                    snapshot.balance = json!({ "eth": index });
                    store.upsert_wallet(&snapshot).map(|_| ())
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok(result) => must(result),
                Err(_) => panic!("upsert thread panicked"),
            }
        }

        let count: i64 = store.with_connection(|conn| {
            match conn.query_row("SELECT COUNT(*) FROM wallets", [], |row| row.get(0)) {
                Ok(value) => value,
                Err(err) => panic!("test failure: {err}"),
            }
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn two_stores_on_one_file_agree_on_upserts() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        };
        let path = dir.path().join("ledger.sqlite3");

        let left = must(SqliteLedgerStore::open(&path));
        must(left.migrate());
        let right = must(SqliteLedgerStore::open(&path));
        must(right.migrate());

        let mut snapshot = WalletSnapshot::new("0xAB", "base-sepolia");
        snapshot.balance = json!({"eth": 1});
        must(left.upsert_wallet(&snapshot));
        snapshot.balance = json!({"eth": 2});
        must(right.upsert_wallet(&snapshot));

        let seen_left = must(left.get_wallet("0xAB"));
        let seen_right = must(right.get_wallet("0xAB"));
        assert_eq!(seen_left, seen_right);
        assert_eq!(seen_left.map(|record| record.balance), Some(json!({"eth": 2})));
    }

    #[test]
    fn metric_samples_filter_by_type_and_window() {
        let store = fixture_store();
        must(store.record_metric_sample(&sample_input("transfer", true)));
        must(store.record_metric_sample(&sample_input("transfer", false)));
        must(store.record_metric_sample(&sample_input("deploy_token", true)));

        store.with_connection(|conn| {
            if let Err(err) = conn.execute_batch(
                "INSERT INTO metric_samples(timestamp, operation_type, wallet_address, duration_ms, success)
                 VALUES ('2020-01-01T00:00:00.000000Z', 'transfer', '0xAB', 1.0, 1);",
            ) {
                panic!("test failure: {err}");
            }
        });

        let transfers = must(store.query_metric_samples(Some("transfer"), 24));
        assert_eq!(transfers.len(), 2);
        assert!(transfers
            .iter()
            .any(|sample| sample.error_kind.as_deref() == Some("StoreError")));

        let all = must(store.query_metric_samples(None, 24));
        assert_eq!(all.len(), 3);

        let types = must(store.operation_types_since(720));
        assert_eq!(types, vec!["deploy_token".to_string(), "transfer".to_string()]);
    }

    #[test]
    fn wallet_samples_are_scoped_to_the_address() {
        let store = fixture_store();
        must(store.record_metric_sample(&sample_input("transfer", true)));
        let mut other = sample_input("transfer", true);
        other.wallet_address = "0xEF".to_string();
        must(store.record_metric_sample(&other));

        let samples = must(store.query_wallet_metric_samples("0xAB", 720));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].wallet_address, "0xAB");
    }

    #[test]
    fn negative_duration_is_rejected() {
        let store = fixture_store();
        let mut input = sample_input("transfer", true);
        input.duration_ms = -1.0;
        assert!(matches!(
            store.record_metric_sample(&input),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn agent_events_filter_by_wallet_and_type() {
        let store = fixture_store();
        let created = must(store.insert_agent_event(&AgentEventInput {
            event_type: "wallet_created".to_string(),
            wallet_address: "0xAB".to_string(),
            details: Some(json!({"network": "base-sepolia"})),
            status: Some("ok".to_string()),
        }));
        must(store.insert_agent_event(&AgentEventInput {
            event_type: "agent_initialized".to_string(),
            wallet_address: "0xAB".to_string(),
            details: None,
            status: None,
        }));

        let only_created = must(store.query_agent_events(Some("0xAB"), Some("wallet_created"), 100));
        assert_eq!(only_created, vec![created]);

        let all = must(store.query_agent_events(Some("0xAB"), None, 100));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, "agent_initialized");
        assert_eq!(all[0].details, None);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let store = fixture_store();
        let inserted = must(store.insert_operation(&transfer_input()));
        must(store.migrate());
        must(store.migrate());

        assert_eq!(must(store.schema_version()), Some(LEDGER_MIGRATION_VERSION));
        assert_eq!(must(store.query_operations(None, 50)), vec![inserted]);
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        let names: Vec<String> = store.with_connection(|conn| {
            let mut stmt = match conn.prepare(
                "SELECT name FROM sqlite_master WHERE type IN ('table', 'trigger') ORDER BY name",
            ) {
                Ok(stmt) => stmt,
                Err(err) => panic!("test failure: {err}"),
            };
            let rows = match stmt.query_map([], |row| row.get::<_, String>(0)) {
                Ok(rows) => rows,
                Err(err) => panic!("test failure: {err}"),
            };
            rows.filter_map(Result::ok).collect()
        });

        for required in [
            "agent_events",
            "metric_samples",
            "operations",
            "schema_migrations",
            "trg_agent_events_no_update",
            "trg_metric_samples_no_delete",
            "trg_operations_no_update",
            "wallets",
        ] {
            assert!(
                names.iter().any(|name| name == required),
                "missing schema object {required}; found {names:?}"
            );
        }
    }

    fn status_from_code(code: u8) -> OperationStatus {
        match code % 3 {
            0 => OperationStatus::Pending,
            1 => OperationStatus::Success,
            _ => OperationStatus::Failed,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_insert_then_query_round_trips(
            wallet in "0x[0-9a-f]{4,40}",
            operation_type in "[a-z_]{1,16}",
            network in "[a-z-]{1,16}",
            status_code in 0u8..3,
            tx_hash in proptest::option::of("0x[0-9a-f]{64}"),
            block_number in proptest::option::of(0i64..50_000_000),
            gas_cents in proptest::option::of(0u32..10_000_000),
            amount_cents in proptest::option::of(0u32..10_000_000),
            memo in "[ -~]{0,24}",
            price in proptest::num::f64::NORMAL | proptest::num::f64::SUBNORMAL | proptest::num::f64::ZERO,
            prices in prop::collection::vec(proptest::num::f64::NORMAL, 0..4),
        ) {
            let store = fixture_store();
            let status = status_from_code(status_code);
            let mut input = OperationInput::new(wallet.clone(), operation_type, network, status);
            input.tx_hash = tx_hash;
            input.block_number = block_number;
            input.gas_used = gas_cents.map(|value| f64::from(value) / 100.0);
            input.amount = amount_cents.map(|value| f64::from(value) / 100.0);
            input.details = json!({ "memo": memo, "price": price, "nested": { "ok": true, "prices": prices } });
            if status == OperationStatus::Failed {
                input.error_message = Some("execution reverted".to_string());
            }

            let inserted = must(store.insert_operation(&input));
            let history = must(store.query_operations(Some(&wallet), 1));

            prop_assert_eq!(history.len(), 1);
            prop_assert_eq!(&history[0], &inserted);
            prop_assert_eq!(&history[0], &OperationRecord::from_input(inserted.id, inserted.timestamp, &input));
        }

        #[test]
        fn prop_repeated_upserts_keep_latest_snapshot(balances in prop::collection::vec(0u32..1_000_000, 1..12)) {
            let store = fixture_store();
            let mut last = None;
            for balance in &balances {
                let mut snapshot = WalletSnapshot::new("0xAB", "base-sepolia");
                snapshot.balance = json!({ "wei": balance });
                snapshot.tokens = vec![json!({ "symbol": "TEST", "amount": balance })];
                must(store.upsert_wallet(&snapshot));
                last = Some(snapshot);
            }

            let stored = must(store.get_wallet("0xAB"));
            let (stored, last) = match (stored, last) {
                (Some(stored), Some(last)) => (stored, last),
                _ => panic!("expected a stored wallet"),
            };
            prop_assert_eq!(stored.balance, last.balance);
            prop_assert_eq!(stored.tokens, last.tokens);
        }
    }
}
