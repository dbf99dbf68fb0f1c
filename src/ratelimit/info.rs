//! Per-model rate-limit record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One counter as reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl Counter {
    pub fn is_reported(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some()
    }

    /// The counter no longer applies once its reset instant has passed.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.reset_at.is_none_or(|r| r > now)
    }

    /// Whether spending `cost` more would exceed the remaining budget.
    pub fn would_exceed(&self, cost: u64, now: DateTime<Utc>) -> bool {
        match self.remaining {
            Some(rem) if self.is_live(now) => rem == 0 || rem < cost,
            _ => false,
        }
    }

    /// Fraction of the limit already used, if both numbers are known.
    pub fn consumed_fraction(&self, now: DateTime<Utc>) -> Option<f64> {
        if !self.is_live(now) {
            return None;
        }
        match (self.limit, self.remaining) {
            (Some(limit), Some(rem)) if limit > 0 => {
                Some(limit.saturating_sub(rem) as f64 / limit as f64)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub requests: Counter,
    pub tokens: Counter,
    /// Anthropic reports input and output tokens separately.
    pub input_tokens: Counter,
    pub output_tokens: Counter,
    /// Cerebras reports daily request budgets.
    pub daily_requests: Counter,
    pub daily_tokens: Counter,
    /// No requests before this instant.
    pub retry_after: Option<DateTime<Utc>>,
    pub raw: HashMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RateLimitInfo {
    pub fn counters(&self) -> [&Counter; 6] {
        [
            &self.requests,
            &self.tokens,
            &self.input_tokens,
            &self.output_tokens,
            &self.daily_requests,
            &self.daily_tokens,
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.retry_after.is_none() && self.counters().iter().all(|c| !c.is_reported())
    }
}
