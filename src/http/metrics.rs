//! Transport-level request metrics.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_latency: Duration,
    pub retries: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl HttpMetricsSnapshot {
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.total_requests == 0 {
            return None;
        }
        let n = u32::try_from(self.total_requests).unwrap_or(u32::MAX);
        Some(self.total_latency / n)
    }
}

/// Lock-protected counters; `snapshot` returns a copy.
#[derive(Debug, Default)]
pub struct HttpMetrics {
    inner: RwLock<HttpMetricsSnapshot>,
}

impl HttpMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, status: Option<u16>, success: bool, latency: Duration) {
        let mut m = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        m.total_requests += 1;
        if success {
            m.successful_requests += 1;
        } else {
            m.failed_requests += 1;
        }
        m.total_latency += latency;
        if let Some(code) = status {
            *m.status_codes.entry(code).or_insert(0) += 1;
        }
        m.last_request_at = Some(Utc::now());
    }

    pub(crate) fn record_retry(&self) {
        let mut m = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        m.retries += 1;
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reset(&self) {
        let mut m = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *m = HttpMetricsSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_histogram_and_mean() {
        let m = HttpMetrics::new();
        m.record(Some(200), true, Duration::from_millis(100));
        m.record(Some(503), false, Duration::from_millis(300));
        m.record(None, false, Duration::from_millis(200));
        m.record_retry();
        let s = m.snapshot();
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.successful_requests, 1);
        assert_eq!(s.failed_requests, 2);
        assert_eq!(s.retries, 1);
        assert_eq!(s.status_codes.get(&503), Some(&1));
        assert_eq!(s.mean_latency(), Some(Duration::from_millis(200)));
        assert!(s.last_request_at.is_some());
    }
}
