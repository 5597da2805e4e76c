//! Operation timing and performance rollups over recorded metric samples.
//!
//! Work is timed through an [`OperationTimer`]. Finishing it records exactly
//! one sample; dropping it unfinished records a failed sample labelled
//! `cancelled` (or `panic` while unwinding). Tracking never changes the
//! outcome of the tracked work: a sample that cannot be stored is reported
//! with `warn!` and otherwise ignored.

#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

use agent_ledger_audit::AuditError;
use agent_ledger_core::{
    compute_gas_trends, compute_operation_stats, compute_wallet_performance, empty_document,
    now_utc, GasTrendPoint, MetricSample, MetricSampleInput, OperationStats, ValidationError,
    WalletPerformance, DEFAULT_GAS_TREND_DAYS, DEFAULT_STATS_WINDOW_HOURS, WALLET_WINDOW_HOURS,
};
use agent_ledger_store_sqlite::{SqliteLedgerStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const CANCELLED_KIND: &str = "cancelled";
pub const PANIC_KIND: &str = "panic";
pub const TIMEOUT_KIND: &str = "timeout";
pub const REJECTED_GAS_DETAIL: &str = "rejected_gas_used";

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ValidationError> for MetricsError {
    fn from(err: ValidationError) -> Self {
        Self::Store(StoreError::Validation(err))
    }
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Short label stored as a failed sample's `error_kind`.
pub trait FailureKind {
    fn failure_kind(&self) -> String;
}

impl FailureKind for ValidationError {
    fn failure_kind(&self) -> String {
        "validation".to_string()
    }
}

impl FailureKind for StoreError {
    fn failure_kind(&self) -> String {
        match self {
            Self::Validation(_) => "validation".to_string(),
            Self::Persistence { .. } => "persistence".to_string(),
        }
    }
}

impl FailureKind for AuditError {
    fn failure_kind(&self) -> String {
        match self {
            Self::Store(inner) => inner.failure_kind(),
            Self::Journal { .. } => "journal".to_string(),
        }
    }
}

impl FailureKind for MetricsError {
    fn failure_kind(&self) -> String {
        match self {
            Self::Store(inner) => inner.failure_kind(),
        }
    }
}

impl FailureKind for std::io::Error {
    fn failure_kind(&self) -> String {
        format!("io.{:?}", self.kind()).to_lowercase()
    }
}

impl FailureKind for tokio::time::error::Elapsed {
    fn failure_kind(&self) -> String {
        TIMEOUT_KIND.to_string()
    }
}

impl FailureKind for anyhow::Error {
    fn failure_kind(&self) -> String {
        if let Some(err) = self.downcast_ref::<AuditError>() {
            return err.failure_kind();
        }
        if let Some(err) = self.downcast_ref::<StoreError>() {
            return err.failure_kind();
        }
        if let Some(err) = self.downcast_ref::<ValidationError>() {
            return err.failure_kind();
        }
        if let Some(err) = self.downcast_ref::<tokio::time::error::Elapsed>() {
            return err.failure_kind();
        }
        if let Some(err) = self.downcast_ref::<std::io::Error>() {
            return err.failure_kind();
        }
        "error".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceReport {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub overall_stats: OperationStats,
    pub gas_trends: Vec<GasTrendPoint>,
    pub operation_types: BTreeMap<String, OperationStats>,
}

#[derive(Debug, Clone)]
pub struct MetricsEngine {
    store: SqliteLedgerStore,
}

impl MetricsEngine {
    #[must_use]
    pub fn new(store: SqliteLedgerStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &SqliteLedgerStore {
        &self.store
    }

    /// Starts timing one unit of work.
    #[must_use]
    pub fn start(&self, operation_type: &str, wallet_address: &str) -> OperationTimer {
        OperationTimer {
            store: self.store.clone(),
            operation_type: operation_type.to_string(),
            wallet_address: wallet_address.to_string(),
            started: Instant::now(),
            gas_used: None,
            details: Map::new(),
            finished: false,
        }
    }

    /// Runs `work`, records one sample for it, and returns its result
    /// unchanged. The timer is handed to `work` so it can attach gas usage
    /// and details before the sample is written.
    pub fn track<T, E, F>(&self, operation_type: &str, wallet_address: &str, work: F) -> Result<T, E>
    where
        E: FailureKind,
        F: FnOnce(&mut OperationTimer) -> Result<T, E>,
    {
        let mut timer = self.start(operation_type, wallet_address);
        let outcome = work(&mut timer);
        match &outcome {
            Ok(_) => {
                timer.succeed();
            }
            Err(err) => {
                timer.fail(err.failure_kind());
            }
        }
        outcome
    }

    /// Async form of [`Self::track`]. Duration is wall-clock time across
    /// every await of `work`; dropping the returned future before it
    /// completes records a `cancelled` sample.
    ///
    /// The sample itself is one short synchronous `SQLite` write made on the
    /// polling thread after `work` finishes. Callers on a saturated runtime
    /// can run the whole call under `tokio::task::spawn_blocking` or wrap
    /// `work` with [`Self::start`] and finish the timer there instead.
    pub async fn track_async<T, E, Fut>(
        &self,
        operation_type: &str,
        wallet_address: &str,
        work: Fut,
    ) -> Result<T, E>
    where
        E: FailureKind,
        Fut: Future<Output = Result<T, E>>,
    {
        let timer = self.start(operation_type, wallet_address);
        let outcome = work.await;
        match &outcome {
            Ok(_) => {
                timer.succeed();
            }
            Err(err) => {
                timer.fail(err.failure_kind());
            }
        }
        outcome
    }

    /// Stores a sample for work the caller timed itself.
    pub fn record_sample(&self, input: &MetricSampleInput) -> MetricsResult<MetricSample> {
        Ok(self.store.record_metric_sample(input)?)
    }

    pub fn get_operation_stats(
        &self,
        operation_type: Option<&str>,
        hours: u32,
    ) -> MetricsResult<OperationStats> {
        let samples = self.store.query_metric_samples(operation_type, hours)?;
        Ok(compute_operation_stats(&samples))
    }

    pub fn get_wallet_performance(&self, wallet_address: &str) -> MetricsResult<WalletPerformance> {
        let samples = self
            .store
            .query_wallet_metric_samples(wallet_address, WALLET_WINDOW_HOURS)?;
        Ok(compute_wallet_performance(wallet_address, &samples))
    }

    pub fn get_gas_usage_trends(
        &self,
        operation_type: Option<&str>,
        days: u32,
    ) -> MetricsResult<Vec<GasTrendPoint>> {
        let samples = self
            .store
            .query_metric_samples(operation_type, days.saturating_mul(24))?;
        Ok(compute_gas_trends(&samples)?)
    }

    pub fn generate_performance_report(&self) -> MetricsResult<PerformanceReport> {
        let overall_stats = self.get_operation_stats(None, DEFAULT_STATS_WINDOW_HOURS)?;
        let gas_trends = self.get_gas_usage_trends(None, DEFAULT_GAS_TREND_DAYS)?;

        let mut operation_types = BTreeMap::new();
        for operation_type in self.store.operation_types_since(WALLET_WINDOW_HOURS)? {
            let stats =
                self.get_operation_stats(Some(&operation_type), DEFAULT_STATS_WINDOW_HOURS)?;
            operation_types.insert(operation_type, stats);
        }

        Ok(PerformanceReport {
            generated_at: now_utc(),
            overall_stats,
            gas_trends,
            operation_types,
        })
    }
}

/// Scoped timer for one operation. Exactly one sample is recorded per timer.
#[derive(Debug)]
pub struct OperationTimer {
    store: SqliteLedgerStore,
    operation_type: String,
    wallet_address: String,
    started: Instant,
    gas_used: Option<f64>,
    details: Map<String, Value>,
    finished: bool,
}

impl OperationTimer {
    /// Attaches a gas figure. A negative or non-finite figure is kept only
    /// as the `rejected_gas_used` detail so the timed sample still records.
    pub fn set_gas_used(&mut self, gas_used: f64) {
        if gas_used.is_finite() && gas_used >= 0.0 {
            self.gas_used = Some(gas_used);
            self.details.remove(REJECTED_GAS_DETAIL);
            return;
        }

        warn!(
            operation_type = %self.operation_type,
            gas_used,
            "ignoring invalid gas figure"
        );
        self.gas_used = None;
        self.details.insert(
            REJECTED_GAS_DETAIL.to_string(),
            Value::String(gas_used.to_string()),
        );
    }

    pub fn set_detail(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.details.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Records a success sample. Returns `None` if it could not be stored.
    #[allow(clippy::must_use_candidate)]
    pub fn succeed(mut self) -> Option<MetricSample> {
        self.finish(true, None)
    }

    #[allow(clippy::must_use_candidate)]
    pub fn fail(mut self, error_kind: impl Into<String>) -> Option<MetricSample> {
        self.finish(false, Some(error_kind.into()))
    }

    fn finish(&mut self, success: bool, error_kind: Option<String>) -> Option<MetricSample> {
        self.finished = true;

        let details = if self.details.is_empty() {
            empty_document()
        } else {
            Value::Object(std::mem::take(&mut self.details))
        };
        let input = MetricSampleInput {
            operation_type: self.operation_type.clone(),
            wallet_address: self.wallet_address.clone(),
            duration_ms: self.elapsed_ms(),
            success,
            error_kind,
            gas_used: self.gas_used,
            details,
        };

        match self.store.record_metric_sample(&input) {
            Ok(sample) => {
                debug!(
                    id = sample.id,
                    operation_type = %sample.operation_type,
                    success,
                    duration_ms = sample.duration_ms,
                    "operation tracked"
                );
                Some(sample)
            }
            Err(err) => {
                warn!(
                    operation_type = %input.operation_type,
                    wallet = %input.wallet_address,
                    error = %err,
                    "failed to record metric sample"
                );
                None
            }
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let kind = if std::thread::panicking() {
            PANIC_KIND
        } else {
            CANCELLED_KIND
        };
        self.finish(false, Some(kind.to_string()));
    }
}
