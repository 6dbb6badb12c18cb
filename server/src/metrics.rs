use lifland_execution::ErrorKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.update_max(ms);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }

    fn update_max(&self, value: u64) {
        let mut current = self.max_ms.load(Ordering::Relaxed);
        while value > current {
            match self.max_ms.compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }
}

/// Ledger operations exposed over HTTP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Fund,
    Take,
    Announce,
    Join,
    Result,
    Balance,
    Reset,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Self::Fund,
        Self::Take,
        Self::Announce,
        Self::Join,
        Self::Result,
        Self::Balance,
        Self::Reset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fund => "fund",
            Self::Take => "take",
            Self::Announce => "announce",
            Self::Join => "join",
            Self::Result => "result",
            Self::Balance => "balance",
            Self::Reset => "reset",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub fund: LatencySnapshot,
    pub take: LatencySnapshot,
    pub announce: LatencySnapshot,
    pub join: LatencySnapshot,
    pub result: LatencySnapshot,
    pub balance: LatencySnapshot,
    pub reset: LatencySnapshot,
    pub reject_body_limit: u64,
    pub reject_rate_limit: u64,
}

#[derive(Default)]
pub struct HttpMetrics {
    fund: LatencyMetrics,
    take: LatencyMetrics,
    announce: LatencyMetrics,
    join: LatencyMetrics,
    result: LatencyMetrics,
    balance: LatencyMetrics,
    reset: LatencyMetrics,
    reject_body_limit: AtomicU64,
    reject_rate_limit: AtomicU64,
}

impl HttpMetrics {
    fn latency(&self, operation: Operation) -> &LatencyMetrics {
        match operation {
            Operation::Fund => &self.fund,
            Operation::Take => &self.take,
            Operation::Announce => &self.announce,
            Operation::Join => &self.join,
            Operation::Result => &self.result,
            Operation::Balance => &self.balance,
            Operation::Reset => &self.reset,
        }
    }

    pub fn record(&self, operation: Operation, duration: Duration) {
        self.latency(operation).record(duration);
    }

    pub fn latency_snapshot(&self, operation: Operation) -> LatencySnapshot {
        self.latency(operation).snapshot()
    }

    pub fn inc_reject_body_limit(&self) {
        self.reject_body_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_rate_limit(&self) {
        self.reject_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            fund: self.fund.snapshot(),
            take: self.take.snapshot(),
            announce: self.announce.snapshot(),
            join: self.join.snapshot(),
            result: self.result.snapshot(),
            balance: self.balance.snapshot(),
            reset: self.reset.snapshot(),
            reject_body_limit: self.reject_body_limit.load(Ordering::Relaxed),
            reject_rate_limit: self.reject_rate_limit.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct LedgerMetricsSnapshot {
    pub committed: u64,
    pub sponsored_joins: u64,
    pub settlements: u64,
    pub rejected_validation: u64,
    pub rejected_insufficient_funds: u64,
    pub rejected_not_found: u64,
    pub rejected_conflict: u64,
    pub storage_failures: u64,
    pub in_flight: u64,
}

/// Outcome counters for ledger transactions.
#[derive(Default)]
pub struct LedgerMetrics {
    committed: AtomicU64,
    sponsored_joins: AtomicU64,
    settlements: AtomicU64,
    rejected_validation: AtomicU64,
    rejected_insufficient_funds: AtomicU64,
    rejected_not_found: AtomicU64,
    rejected_conflict: AtomicU64,
    storage_failures: AtomicU64,
    in_flight: AtomicU64,
}

impl LedgerMetrics {
    pub fn inc_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sponsored_join(&self) {
        self.sponsored_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_settlement(&self) {
        self.settlements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::Validation => &self.rejected_validation,
            ErrorKind::InsufficientFunds => &self.rejected_insufficient_funds,
            ErrorKind::NotFound => &self.rejected_not_found,
            ErrorKind::Conflict => &self.rejected_conflict,
            ErrorKind::Storage => &self.storage_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_in_flight(&self) {
        let mut current = self.in_flight.load(Ordering::Relaxed);
        while current > 0 {
            match self.in_flight.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }

    pub fn snapshot(&self) -> LedgerMetricsSnapshot {
        LedgerMetricsSnapshot {
            committed: self.committed.load(Ordering::Relaxed),
            sponsored_joins: self.sponsored_joins.load(Ordering::Relaxed),
            settlements: self.settlements.load(Ordering::Relaxed),
            rejected_validation: self.rejected_validation.load(Ordering::Relaxed),
            rejected_insufficient_funds: self.rejected_insufficient_funds.load(Ordering::Relaxed),
            rejected_not_found: self.rejected_not_found.load(Ordering::Relaxed),
            rejected_conflict: self.rejected_conflict.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}
