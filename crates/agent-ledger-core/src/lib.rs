//! Domain types and pure rollups for the agent operation ledger.
//!
//! Nothing in this crate performs I/O. The store, audit, and metrics crates
//! build on these records and on the aggregation functions at the bottom of
//! the module.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

pub const DEFAULT_NETWORK: &str = "base-sepolia";
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const DEFAULT_EVENT_LIMIT: usize = 100;
pub const DEFAULT_STATS_WINDOW_HOURS: u32 = 24;
pub const WALLET_WINDOW_HOURS: u32 = 720;
pub const DEFAULT_GAS_TREND_DAYS: u32 = 7;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("validation error: {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    #[must_use]
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Success,
    Failed,
}

impl OperationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Parses a status tag supplied by a caller.
    ///
    /// # Errors
    /// Returns [`ValidationError`] for anything other than
    /// `pending`, `success`, or `failed`.
    pub fn parse_input(value: &str) -> Result<Self, ValidationError> {
        Self::parse(value.trim()).ok_or_else(|| {
            ValidationError::new(
                "status",
                format!("expected one of pending|success|failed, got {value:?}"),
            )
        })
    }
}

impl Display for OperationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attempted blockchain operation as reported by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationInput {
    pub wallet_address: String,
    pub operation_type: String,
    pub network: String,
    pub status: OperationStatus,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub gas_used: Option<f64>,
    pub amount: Option<f64>,
    pub token_address: Option<String>,
    pub recipient_address: Option<String>,
    pub details: Value,
    pub error_message: Option<String>,
}

impl OperationInput {
    /// Builds an input carrying only the required fields.
    #[must_use]
    pub fn new(
        wallet_address: impl Into<String>,
        operation_type: impl Into<String>,
        network: impl Into<String>,
        status: OperationStatus,
    ) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            operation_type: operation_type.into(),
            network: network.into(),
            status,
            tx_hash: None,
            block_number: None,
            gas_used: None,
            amount: None,
            token_address: None,
            recipient_address: None,
            details: empty_document(),
            error_message: None,
        }
    }

    /// Validates an operation before it is written.
    ///
    /// # Errors
    /// Returns [`ValidationError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("wallet_address", &self.wallet_address)?;
        require_non_empty("operation_type", &self.operation_type)?;
        require_non_empty("network", &self.network)?;

        if let Some(block_number) = self.block_number {
            if block_number < 0 {
                return Err(ValidationError::new(
                    "block_number",
                    "block_number MUST be >= 0",
                ));
            }
        }

        require_non_negative("gas_used", self.gas_used)?;
        require_non_negative("amount", self.amount)?;

        if self.error_message.is_some() && self.status != OperationStatus::Failed {
            return Err(ValidationError::new(
                "error_message",
                format!(
                    "error_message is only allowed when status=failed (status={})",
                    self.status
                ),
            ));
        }

        Ok(())
    }
}

/// A persisted operation. Never updated once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationRecord {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub wallet_address: String,
    pub operation_type: String,
    pub network: String,
    pub status: OperationStatus,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub gas_used: Option<f64>,
    pub amount: Option<f64>,
    pub token_address: Option<String>,
    pub recipient_address: Option<String>,
    pub details: Value,
    pub error_message: Option<String>,
}

impl OperationRecord {
    #[must_use]
    pub fn from_input(id: i64, timestamp: OffsetDateTime, input: &OperationInput) -> Self {
        Self {
            id,
            timestamp,
            wallet_address: input.wallet_address.clone(),
            operation_type: input.operation_type.clone(),
            network: input.network.clone(),
            status: input.status,
            tx_hash: input.tx_hash.clone(),
            block_number: input.block_number,
            gas_used: input.gas_used,
            amount: input.amount,
            token_address: input.token_address.clone(),
            recipient_address: input.recipient_address.clone(),
            details: input.details.clone(),
            error_message: input.error_message.clone(),
        }
    }
}

/// A full wallet snapshot. Writing it replaces whatever was stored before.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletSnapshot {
    pub address: String,
    pub network: String,
    pub balance: Value,
    pub tokens: Vec<Value>,
    pub metadata: Value,
}

impl WalletSnapshot {
    #[must_use]
    pub fn new(address: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            network: network.into(),
            balance: empty_document(),
            tokens: Vec::new(),
            metadata: empty_document(),
        }
    }

    /// Validates the snapshot before upsert.
    ///
    /// # Errors
    /// Returns [`ValidationError`] when the address or network is blank.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("address", &self.address)?;
        require_non_empty("network", &self.network)
    }

    /// Builds a snapshot from a wallet provider export document.
    ///
    /// The address is taken from `address`, falling back to
    /// `default_address_id`. The whole export is kept as metadata.
    ///
    /// # Errors
    /// Returns [`ValidationError`] when the export is not an object, carries
    /// no usable address, or has malformed `balance`/`tokens` entries.
    pub fn from_export(export: &Value, default_network: &str) -> Result<Self, ValidationError> {
        let Some(object) = export.as_object() else {
            return Err(ValidationError::new(
                "wallet_export",
                "wallet export MUST be a JSON object",
            ));
        };

        let address = ["address", "default_address_id"]
            .iter()
            .filter_map(|key| object.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|candidate| !candidate.is_empty())
            .ok_or_else(|| {
                ValidationError::new("address", "no valid address found in wallet export")
            })?;

        let network = object
            .get("network")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(default_network);

        let balance = object.get("balance").cloned().unwrap_or_else(empty_document);
        let tokens = match object.get("tokens") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(ValidationError::new(
                    "tokens",
                    "tokens MUST be a JSON array when present",
                ))
            }
        };

        let snapshot = Self {
            address: address.to_string(),
            network: network.to_string(),
            balance,
            tokens,
            metadata: export.clone(),
        };
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Decodes the text of a wallet provider export.
///
/// # Errors
/// Returns [`ValidationError`] on field `wallet_export` when the text is not
/// JSON.
pub fn parse_wallet_export(raw: &str) -> Result<Value, ValidationError> {
    serde_json::from_str(raw).map_err(|err| {
        ValidationError::new("wallet_export", format!("invalid JSON in wallet export: {err}"))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletRecord {
    pub address: String,
    pub network: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: OffsetDateTime,
    pub balance: Value,
    pub tokens: Vec<Value>,
    pub metadata: Value,
}

/// One timed observation of an instrumented operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSampleInput {
    pub operation_type: String,
    pub wallet_address: String,
    pub duration_ms: f64,
    pub success: bool,
    pub error_kind: Option<String>,
    pub gas_used: Option<f64>,
    pub details: Value,
}

impl MetricSampleInput {
    /// Validates a sample before it is appended.
    ///
    /// # Errors
    /// Returns [`ValidationError`] for blank tags, a negative or non-finite
    /// duration, or an error kind attached to a successful sample.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("operation_type", &self.operation_type)?;
        require_non_empty("wallet_address", &self.wallet_address)?;

        if !self.duration_ms.is_finite() || self.duration_ms < 0.0 {
            return Err(ValidationError::new(
                "duration_ms",
                "duration_ms MUST be a finite value >= 0",
            ));
        }

        require_non_negative("gas_used", self.gas_used)?;

        if self.success && self.error_kind.is_some() {
            return Err(ValidationError::new(
                "error_kind",
                "error_kind is only allowed on failed samples",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub operation_type: String,
    pub wallet_address: String,
    pub duration_ms: f64,
    pub success: bool,
    pub error_kind: Option<String>,
    pub gas_used: Option<f64>,
    pub details: Value,
}

/// A non-transaction lifecycle event such as `wallet_created`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEventInput {
    pub event_type: String,
    pub wallet_address: String,
    pub details: Option<Value>,
    pub status: Option<String>,
}

impl AgentEventInput {
    /// # Errors
    /// Returns [`ValidationError`] when the event type or wallet is blank.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("event_type", &self.event_type)?;
        require_non_empty("wallet_address", &self.wallet_address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub event_type: String,
    pub wallet_address: String,
    pub details: Option<Value>,
    pub status: Option<String>,
}

#[must_use]
pub fn empty_document() -> Value {
    Value::Object(Map::default())
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(
            field,
            format!("{field} MUST be provided"),
        ));
    }
    Ok(())
}

fn require_non_negative(field: &'static str, value: Option<f64>) -> Result<(), ValidationError> {
    match value {
        Some(number) if !number.is_finite() || number < 0.0 => Err(ValidationError::new(
            field,
            format!("{field} MUST be a finite value >= 0"),
        )),
        _ => Ok(()),
    }
}

/// Current UTC time truncated to microseconds, the precision timestamps are
/// stored with.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    truncate_to_micros(OffsetDateTime::now_utc())
}

#[must_use]
pub fn truncate_to_micros(value: OffsetDateTime) -> OffsetDateTime {
    let value = value.to_offset(UtcOffset::UTC);
    value - Duration::nanoseconds(i64::from(value.nanosecond() % 1_000))
}

/// Formats a timestamp in the fixed-width storage form
/// (`2026-02-07T12:00:00.000000Z`). Lexical order of the output matches
/// chronological order.
///
/// # Errors
/// Returns [`ValidationError`] when formatting fails.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, ValidationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .map_err(|err| ValidationError::new("timestamp", format!("failed to format: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ValidationError`] when parsing fails or the offset is not UTC.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, ValidationError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
        ValidationError::new("timestamp", format!("invalid RFC3339 timestamp: {err}"))
    })?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ValidationError::new(
            "timestamp",
            "timestamp MUST use UTC offset Z",
        ));
    }

    Ok(parsed)
}

/// # Errors
/// Returns [`ValidationError`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, ValidationError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| ValidationError::new("date", format!("failed to format: {err}")))
}

/// Start of a trailing window ending at `now`. Windows reaching past the
/// earliest representable date start there.
#[must_use]
pub fn window_start(now: OffsetDateTime, window_hours: u32) -> OffsetDateTime {
    now.checked_sub(Duration::hours(i64::from(window_hours)))
        .unwrap_or_else(|| Date::MIN.midnight().assume_utc())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationStats {
    pub total_operations: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub avg_gas_used: f64,
    pub error_types: BTreeMap<String, u64>,
}

impl OperationStats {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            total_operations: 0,
            success_rate: 0.0,
            avg_duration_ms: 0.0,
            min_duration_ms: 0.0,
            max_duration_ms: 0.0,
            avg_gas_used: 0.0,
            error_types: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationTypeSummary {
    pub count: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletPerformance {
    pub wallet_address: String,
    pub total_operations: u64,
    pub operations_by_type: BTreeMap<String, OperationTypeSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GasTrendPoint {
    pub date: String,
    pub avg_gas_used: f64,
    pub total_operations: u64,
}

/// Rolls a set of samples up into success rate, latency, gas, and error
/// counts. An empty slice yields [`OperationStats::empty`].
#[must_use]
pub fn compute_operation_stats(samples: &[MetricSample]) -> OperationStats {
    if samples.is_empty() {
        return OperationStats::empty();
    }

    let durations: Vec<f64> = samples.iter().map(|sample| sample.duration_ms).collect();
    let gas: Vec<f64> = samples.iter().filter_map(|sample| sample.gas_used).collect();

    OperationStats {
        total_operations: count_u64(samples.len()),
        success_rate: success_rate(
            samples.iter().filter(|sample| sample.success).count(),
            samples.len(),
        ),
        avg_duration_ms: mean(&durations),
        min_duration_ms: durations.iter().copied().reduce(f64::min).unwrap_or(0.0),
        max_duration_ms: durations.iter().copied().reduce(f64::max).unwrap_or(0.0),
        avg_gas_used: mean(&gas),
        error_types: error_kind_counts(samples),
    }
}

/// Groups one wallet's samples by operation type.
#[must_use]
pub fn compute_wallet_performance(
    wallet_address: &str,
    samples: &[MetricSample],
) -> WalletPerformance {
    let mut grouped: BTreeMap<&str, Vec<&MetricSample>> = BTreeMap::new();
    let mut total = 0_usize;
    for sample in samples
        .iter()
        .filter(|sample| sample.wallet_address == wallet_address)
    {
        grouped
            .entry(sample.operation_type.as_str())
            .or_default()
            .push(sample);
        total += 1;
    }

    let operations_by_type = grouped
        .into_iter()
        .map(|(operation_type, group)| {
            let durations: Vec<f64> = group.iter().map(|sample| sample.duration_ms).collect();
            let summary = OperationTypeSummary {
                count: count_u64(group.len()),
                success_rate: success_rate(
                    group.iter().filter(|sample| sample.success).count(),
                    group.len(),
                ),
                avg_duration_ms: mean(&durations),
            };
            (operation_type.to_string(), summary)
        })
        .collect();

    WalletPerformance {
        wallet_address: wallet_address.to_string(),
        total_operations: count_u64(total),
        operations_by_type,
    }
}

/// Buckets gas figures by the UTC calendar date of each sample, oldest date
/// first. Samples without a non-zero gas figure do not contribute, so a date
/// only appears when at least one sample reported gas on it.
///
/// # Errors
/// Returns [`ValidationError`] if a bucket date cannot be formatted.
#[allow(clippy::float_cmp)]
pub fn compute_gas_trends(samples: &[MetricSample]) -> Result<Vec<GasTrendPoint>, ValidationError> {
    let mut buckets: BTreeMap<Date, Vec<f64>> = BTreeMap::new();
    for sample in samples {
        let Some(gas) = sample.gas_used else {
            continue;
        };
        if gas == 0.0 {
            continue;
        }
        buckets
            .entry(sample.timestamp.to_offset(UtcOffset::UTC).date())
            .or_default()
            .push(gas);
    }

    buckets
        .into_iter()
        .map(|(date, values)| {
            Ok(GasTrendPoint {
                date: format_date(date)?,
                avg_gas_used: mean(&values),
                total_operations: count_u64(values.len()),
            })
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn success_rate(successes: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (successes as f64 / total as f64) * 100.0
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn error_kind_counts(samples: &[MetricSample]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for sample in samples.iter().filter(|sample| !sample.success) {
        if let Some(kind) = sample.error_kind.as_deref().filter(|kind| !kind.is_empty()) {
            *counts.entry(kind.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

fn count_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
