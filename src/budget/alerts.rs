//! Budget alert log with per-(period, severity) rate limiting.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::period::BudgetPeriod;

/// Most alerts retained; the oldest are dropped first.
const MAX_ALERTS: usize = 500;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Usage crossed the warning percentage.
    Warning,
    /// Usage would exceed (or has exceeded) the limit.
    LimitExceeded,
    /// A period was reset administratively.
    Reset,
}

/// A budget notification raised by the governor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    /// Unique alert id.
    pub id: Uuid,
    /// Severity.
    pub severity: AlertSeverity,
    /// Period the alert concerns.
    pub period: BudgetPeriod,
    /// Human-readable description.
    pub message: String,
    /// When the alert was raised.
    pub created_at: DateTime<Utc>,
    /// Whether an operator has acknowledged the alert.
    pub acknowledged: bool,
}

#[derive(Debug, Default)]
pub(crate) struct AlertLog {
    alerts: Vec<BudgetAlert>,
    last_emitted: HashMap<(BudgetPeriod, AlertSeverity), DateTime<Utc>>,
}

impl AlertLog {
    /// Raise an alert unless the same (period, severity) pair fired within
    /// `cooldown`. Reset alerts are never suppressed.
    pub(crate) fn emit(
        &mut self,
        severity: AlertSeverity,
        period: BudgetPeriod,
        message: String,
        now: DateTime<Utc>,
        cooldown: chrono::Duration,
    ) -> Option<BudgetAlert> {
        let key = (period, severity);
        if severity != AlertSeverity::Reset {
            if let Some(last) = self.last_emitted.get(&key) {
                if now - *last < cooldown {
                    return None;
                }
            }
        }
        self.last_emitted.insert(key, now);

        let alert = BudgetAlert {
            id: Uuid::new_v4(),
            severity,
            period,
            message,
            created_at: now,
            acknowledged: false,
        };
        self.alerts.push(alert.clone());
        if self.alerts.len() > MAX_ALERTS {
            let excess = self.alerts.len() - MAX_ALERTS;
            self.alerts.drain(..excess);
        }
        Some(alert)
    }

    pub(crate) fn active(&self) -> Vec<BudgetAlert> {
        self.alerts
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    /// Returns `false` if no alert has this id.
    pub(crate) fn acknowledge(&mut self, id: Uuid) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hour() -> chrono::Duration {
        chrono::Duration::hours(1)
    }

    #[test]
    fn test_same_pair_is_suppressed_within_cooldown() {
        let mut log = AlertLog::default();
        let now = Utc::now();
        assert!(log
            .emit(AlertSeverity::Warning, BudgetPeriod::Daily, "a".into(), now, hour())
            .is_some());
        assert!(log
            .emit(
                AlertSeverity::Warning,
                BudgetPeriod::Daily,
                "b".into(),
                now + chrono::Duration::minutes(59),
                hour()
            )
            .is_none());
        assert!(log
            .emit(
                AlertSeverity::Warning,
                BudgetPeriod::Daily,
                "c".into(),
                now + chrono::Duration::minutes(60),
                hour()
            )
            .is_some());
    }

    #[test]
    fn test_different_pairs_are_independent() {
        let mut log = AlertLog::default();
        let now = Utc::now();
        assert!(log
            .emit(AlertSeverity::Warning, BudgetPeriod::Daily, "a".into(), now, hour())
            .is_some());
        assert!(log
            .emit(AlertSeverity::Warning, BudgetPeriod::Weekly, "b".into(), now, hour())
            .is_some());
        assert!(log
            .emit(AlertSeverity::LimitExceeded, BudgetPeriod::Daily, "c".into(), now, hour())
            .is_some());
        assert_eq!(log.active().len(), 3);
    }

    #[test]
    fn test_reset_alerts_are_never_suppressed() {
        let mut log = AlertLog::default();
        let now = Utc::now();
        for _ in 0..3 {
            assert!(log
                .emit(AlertSeverity::Reset, BudgetPeriod::Daily, "r".into(), now, hour())
                .is_some());
        }
    }

    #[test]
    fn test_acknowledge_removes_from_active() {
        let mut log = AlertLog::default();
        let alert = log
            .emit(AlertSeverity::Warning, BudgetPeriod::Daily, "a".into(), Utc::now(), hour())
            .expect("test: emitted");
        assert!(log.acknowledge(alert.id));
        assert!(log.active().is_empty());
        assert!(!log.acknowledge(Uuid::new_v4()));
    }
}
