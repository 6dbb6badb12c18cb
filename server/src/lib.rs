//! HTTP service for the lifland tournament ledger.

use lifland_execution::{Engine, EngineError, ErrorKind};
use std::sync::Arc;
use std::time::Instant;

mod api;
pub use api::Api;

pub mod config;
pub use config::{BackendKind, ConfigError, LogFormat, ServerConfig};

mod metrics;
pub use metrics::{HttpMetricsSnapshot, LatencySnapshot, LedgerMetricsSnapshot, Operation};
use metrics::{HttpMetrics, LedgerMetrics};

pub mod persistence;
pub use persistence::LedgerStore;

/// Shared state behind every request: the engine and its metrics.
pub struct Ledger {
    engine: Engine<LedgerStore>,
    config: ServerConfig,
    http_metrics: HttpMetrics,
    ledger_metrics: LedgerMetrics,
}

impl Ledger {
    pub fn new(store: LedgerStore, config: ServerConfig) -> Self {
        Self {
            engine: Engine::new(store, config.engine_config()),
            config,
            http_metrics: HttpMetrics::default(),
            ledger_metrics: LedgerMetrics::default(),
        }
    }

    /// Opens the configured backend.
    pub fn open(config: ServerConfig) -> anyhow::Result<Self> {
        let store = LedgerStore::open(&config)?;
        tracing::info!(backend = %store.kind(), "ledger store ready");
        Ok(Self::new(store, config))
    }

    pub fn engine(&self) -> &Engine<LedgerStore> {
        &self.engine
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub fn http_metrics_snapshot(&self) -> HttpMetricsSnapshot {
        self.http_metrics.snapshot()
    }

    pub fn ledger_metrics_snapshot(&self) -> LedgerMetricsSnapshot {
        self.ledger_metrics.snapshot()
    }

    /// Runs `f` against the engine on the blocking pool and records the
    /// outcome.
    pub async fn execute<T, F>(
        self: &Arc<Self>,
        operation: Operation,
        f: F,
    ) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine<LedgerStore>) -> Result<T, EngineError> + Send + 'static,
    {
        let start = Instant::now();
        self.ledger_metrics.inc_in_flight();
        let ledger = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || f(&ledger.engine))
            .await
            .unwrap_or_else(|err| Err(anyhow::anyhow!("ledger task failed: {err}").into()));
        self.ledger_metrics.dec_in_flight();
        self.http_metrics.record(operation, start.elapsed());

        match &result {
            Ok(_) => self.ledger_metrics.inc_committed(),
            Err(err) => {
                let kind = err.kind();
                self.ledger_metrics.inc_rejected(kind);
                if kind == ErrorKind::Storage {
                    tracing::error!(
                        operation = operation.as_str(),
                        error = ?err,
                        "ledger storage failure"
                    );
                }
            }
        }
        result
    }

    fn record_sponsored_join(&self) {
        self.ledger_metrics.inc_sponsored_join();
    }

    fn record_settlement(&self) {
        self.ledger_metrics.inc_settlement();
    }

    fn record_rejected(&self, kind: ErrorKind) {
        self.ledger_metrics.inc_rejected(kind);
    }
}
