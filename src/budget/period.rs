//! Calendar-aligned budget periods.
//!
//! All windows are computed in UTC: days start at midnight, weeks on Monday
//! midnight, months on the 1st.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Accounting window with its own spend limit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Resets every day at 00:00 UTC.
    Daily,
    /// Resets every Monday at 00:00 UTC.
    Weekly,
    /// Resets on the first day of every month at 00:00 UTC.
    Monthly,
}

impl BudgetPeriod {
    /// Every period, shortest first.
    pub const ALL: [BudgetPeriod; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    /// Lower-case name used in logs, metrics and alert messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Parse `"daily"`, `"weekly"` or `"monthly"` (case-insensitive).
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    /// Start of the window containing `now`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn window_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let date = match self {
            Self::Daily => today,
            Self::Weekly => {
                today - chrono::Duration::days(i64::from(today.weekday().num_days_from_monday()))
            }
            Self::Monthly => today.with_day(1).unwrap_or(today),
        };
        midnight(date)
    }

    /// Moment the window containing `now` rolls over.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn reset_at(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.window_start(now);
        match self {
            Self::Daily => start + chrono::Duration::days(1),
            Self::Weekly => start + chrono::Duration::days(7),
            Self::Monthly => start
                .checked_add_months(Months::new(1))
                .unwrap_or(start + chrono::Duration::days(31)),
        }
    }
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}
