//! Append-only usage ledger.
//!
//! Spend per period is derived on read by summing records inside the
//! period's window. Administrative resets are stored as per-period markers
//! rather than by deleting records, so resetting one period never changes
//! another period's totals.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::period::BudgetPeriod;

/// One completed provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Provider that served the call.
    pub provider: String,
    /// Model that served the call.
    pub model: String,
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
    /// USD charged.
    pub cost: f64,
    /// When the call completed.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct UsageLedger {
    records: Vec<UsageRecord>,
    reset_markers: HashMap<BudgetPeriod, DateTime<Utc>>,
}

impl UsageLedger {
    /// Append a record and drop entries that fall outside the retention
    /// window and outside every period's current window.
    pub(crate) fn append(&mut self, record: UsageRecord, retention: chrono::Duration) {
        let now = record.timestamp;
        let cutoff = BudgetPeriod::ALL
            .iter()
            .map(|p| p.window_start(now))
            .fold(now - retention, Ord::min);
        self.records.push(record);
        self.records.retain(|r| r.timestamp >= cutoff);
    }

    /// Spend accumulated in `period`'s current window.
    pub(crate) fn period_usage(&self, period: BudgetPeriod, now: DateTime<Utc>) -> f64 {
        let from = self.effective_start(period, now);
        self.records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= now)
            .map(|r| r.cost)
            .sum()
    }

    /// Spend on a single model in the current daily window.
    pub(crate) fn model_daily_usage(&self, provider: &str, model: &str, now: DateTime<Utc>) -> f64 {
        let from = BudgetPeriod::Daily.window_start(now);
        self.records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= now)
            .filter(|r| r.provider == provider && r.model == model)
            .map(|r| r.cost)
            .sum()
    }

    /// Clear accumulated usage for `period` as of `now`.
    pub(crate) fn reset(&mut self, period: BudgetPeriod, now: DateTime<Utc>) {
        self.reset_markers.insert(period, now);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    fn effective_start(&self, period: BudgetPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = period.window_start(now);
        match self.reset_markers.get(&period) {
            Some(marker) if *marker > window => *marker,
            _ => window,
        }
    }
}
