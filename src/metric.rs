use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// HTTP traffic counters. Independent of the experiment state, so a stats
/// reset leaves them alone.
pub struct MetricsCollector {
    started_at: DateTime<Utc>,
    request_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            request_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.request_count.load(Ordering::Relaxed),
            rejected: self.rejected_count.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub rejected: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
}
