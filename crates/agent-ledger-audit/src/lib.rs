//! Dual-sink audit logging: every entry is committed to the record store
//! first and then appended as one JSON line to a per-category journal file.
//!
//! The journal is never read back by this crate. It only ever holds entries
//! whose relational row already committed; a failed append leaves the row in
//! place and reports [`AuditError::Journal`].

#![allow(clippy::missing_errors_doc)]

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use agent_ledger_core::{
    format_timestamp, AgentEvent, AgentEventInput, OperationInput, OperationRecord,
    ValidationError,
};
use agent_ledger_store_sqlite::{SqliteLedgerStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

pub const TRANSACTION_JOURNAL: &str = "transactions.log";
pub const AGENT_EVENT_JOURNAL: &str = "agent_events.log";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("journal write to {} failed after record {committed_id} was committed: {source}", path.display())]
    Journal {
        path: PathBuf,
        committed_id: i64,
        #[source]
        source: io::Error,
    },
}

impl AuditError {
    /// Id of the relational row that is committed despite this error, if any.
    #[must_use]
    pub fn committed_id(&self) -> Option<i64> {
        match self {
            Self::Journal { committed_id, .. } => Some(*committed_id),
            Self::Store(_) => None,
        }
    }
}

impl From<ValidationError> for AuditError {
    fn from(err: ValidationError) -> Self {
        Self::Store(StoreError::Validation(err))
    }
}

pub type AuditResult<T> = Result<T, AuditError>;

/// Journal category; each maps to one file under the journal directory.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum JournalKind {
    Transaction,
    AgentEvent,
}

impl JournalKind {
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Transaction => TRANSACTION_JOURNAL,
            Self::AgentEvent => AGENT_EVENT_JOURNAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLogger {
    store: SqliteLedgerStore,
    journal_dir: PathBuf,
    journal_lock: Arc<Mutex<()>>,
}

impl AuditLogger {
    #[must_use]
    pub fn new(store: SqliteLedgerStore, journal_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            journal_dir: journal_dir.into(),
            journal_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn store(&self) -> &SqliteLedgerStore {
        &self.store
    }

    #[must_use]
    pub fn journal_dir(&self) -> &Path {
        &self.journal_dir
    }

    #[must_use]
    pub fn journal_path(&self, kind: JournalKind) -> PathBuf {
        self.journal_dir.join(kind.file_name())
    }

    /// Records one operation in the store, then journals it.
    pub fn log_transaction(&self, input: &OperationInput) -> AuditResult<OperationRecord> {
        let record = self.store.insert_operation(input)?;
        self.append(JournalKind::Transaction, record.id, &record)?;
        Ok(record)
    }

    pub fn log_agent_event(&self, input: &AgentEventInput) -> AuditResult<AgentEvent> {
        let event = self.store.insert_agent_event(input)?;
        self.append(JournalKind::AgentEvent, event.id, &event)?;
        Ok(event)
    }

    pub fn query_transaction_history(
        &self,
        wallet_address: Option<&str>,
        limit: usize,
    ) -> AuditResult<Vec<OperationRecord>> {
        Ok(self.store.query_operations(wallet_address, limit)?)
    }

    pub fn query_agent_events(
        &self,
        wallet_address: Option<&str>,
        event_type: Option<&str>,
        limit: usize,
    ) -> AuditResult<Vec<AgentEvent>> {
        Ok(self
            .store
            .query_agent_events(wallet_address, event_type, limit)?)
    }

    fn append<T: Serialize + Timestamped>(
        &self,
        kind: JournalKind,
        committed_id: i64,
        entry: &T,
    ) -> AuditResult<()> {
        let path = self.journal_path(kind);
        let written = journal_line(entry).and_then(|line| {
            let _guard = self
                .journal_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            append_line(&self.journal_dir, &path, &line)
        });

        if let Err(source) = written {
            warn!(
                path = %path.display(),
                committed_id,
                error = %source,
                "journal write failed after commit"
            );
            return Err(AuditError::Journal {
                path,
                committed_id,
                source,
            });
        }

        debug!(path = %path.display(), committed_id, "journal entry appended");
        Ok(())
    }
}

trait Timestamped {
    fn timestamp(&self) -> time::OffsetDateTime;
}

impl Timestamped for OperationRecord {
    fn timestamp(&self) -> time::OffsetDateTime {
        self.timestamp
    }
}

impl Timestamped for AgentEvent {
    fn timestamp(&self) -> time::OffsetDateTime {
        self.timestamp
    }
}

// The line carries the same fixed-width timestamp the store holds.
fn journal_line<T: Serialize + Timestamped>(entry: &T) -> io::Result<String> {
    let mut value = serde_json::to_value(entry)?;
    if let Value::Object(fields) = &mut value {
        let stamp = format_timestamp(entry.timestamp())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fields.insert("timestamp".to_string(), Value::String(stamp));
    }
    let mut line = serde_json::to_string(&value)?;
    line.push('\n');
    Ok(line)
}

fn append_line(dir: &Path, path: &Path, line: &str) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.flush()
}
