//! # Stage: Budget Governor
//!
//! ## Responsibility
//! Track spend across daily, weekly and monthly windows, decide before each
//! provider call whether it may proceed, record usage after each completed
//! call, and raise rate-limited alerts.
//!
//! ## Guarantees
//! - Pre-flight only: [`BudgetGovernor::check_budget`] never touches the ledger
//! - Soft mode never blocks; hard mode blocks when any window would overflow
//! - Alerts of the same (period, severity) are emitted at most once per
//!   `alert_cooldown_s`
//! - Recorded usage is counted exactly once, also under concurrent callers
//!
//! ## NOT Responsible For
//! - Estimating tokens or cost (callers pass estimates in)
//! - Atomic check-and-reserve: two concurrent callers can both pass the
//!   check before either records usage

pub mod alerts;
pub mod ledger;
pub mod period;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{GlobalLimits, ModelDescriptor};
use crate::clock::Clock;
use crate::metrics;

pub use alerts::{AlertSeverity, BudgetAlert};
pub use ledger::UsageRecord;
pub use period::BudgetPeriod;

use alerts::AlertLog;
use ledger::UsageLedger;

// ── Default value functions ────────────────────────────────────────────

fn default_daily_limit() -> f64 {
    10.0
}

fn default_weekly_limit() -> f64 {
    50.0
}

fn default_monthly_limit() -> f64 {
    200.0
}

fn default_warning_threshold_percent() -> f64 {
    80.0
}

fn default_alert_cooldown_s() -> u64 {
    3600
}

fn default_retention_days() -> u32 {
    30
}

// ── Config ─────────────────────────────────────────────────────────────

/// Spend limits and alerting policy.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BudgetConfig {
    /// USD allowed per UTC day.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: f64,
    /// USD allowed per ISO week.
    #[serde(default = "default_weekly_limit")]
    pub weekly_limit: f64,
    /// USD allowed per calendar month.
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: f64,
    /// Block calls that would exceed any limit. When `false` the governor
    /// only warns.
    #[serde(default)]
    pub hard_limit: bool,
    /// Percentage of a limit at which a warning alert is raised.
    #[serde(default = "default_warning_threshold_percent")]
    pub warning_threshold_percent: f64,
    /// Minimum seconds between two alerts of the same period and severity.
    #[serde(default = "default_alert_cooldown_s")]
    pub alert_cooldown_s: u64,
    /// Days of usage history kept in the ledger.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            weekly_limit: default_weekly_limit(),
            monthly_limit: default_monthly_limit(),
            hard_limit: false,
            warning_threshold_percent: default_warning_threshold_percent(),
            alert_cooldown_s: default_alert_cooldown_s(),
            retention_days: default_retention_days(),
        }
    }
}

impl BudgetConfig {
    /// Limit configured for `period`.
    pub fn limit_for(&self, period: BudgetPeriod) -> f64 {
        match period {
            BudgetPeriod::Daily => self.daily_limit,
            BudgetPeriod::Weekly => self.weekly_limit,
            BudgetPeriod::Monthly => self.monthly_limit,
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

/// Errors raised by the budget governor.
#[derive(Debug, Error)]
pub enum BudgetError {
    /// Hard-limit mode refused the call before it reached a provider.
    #[error("budget exceeded for {provider}/{model}: {periods:?} would exceed limit")]
    BudgetExceeded {
        /// Provider the call was meant for.
        provider: String,
        /// Model the call was meant for.
        model: String,
        /// Every period whose limit the call would exceed.
        periods: Vec<BudgetPeriod>,
    },

    /// No alert with this id exists.
    #[error("alert not found: {0}")]
    AlertNotFound(Uuid),
}

// ── Results ────────────────────────────────────────────────────────────

/// Outcome of a pre-flight budget check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheck {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Periods whose limit `used + estimated cost` would exceed.
    pub exceeded_periods: Vec<BudgetPeriod>,
    /// Alerts raised by this check.
    pub alerts: Vec<BudgetAlert>,
}

/// Spend in one period's current window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetPeriodStatus {
    /// Which period.
    pub period: BudgetPeriod,
    /// USD spent since the window (or the last reset) began.
    pub used_amount: f64,
    /// Configured limit in USD.
    pub limit_amount: f64,
    /// When the window rolls over.
    pub reset_at: DateTime<Utc>,
}

impl BudgetPeriodStatus {
    /// Used fraction of the limit as a percentage.
    pub fn percent_used(&self) -> f64 {
        if self.limit_amount > 0.0 {
            self.used_amount / self.limit_amount * 100.0
        } else {
            0.0
        }
    }
}

// ── Governor ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GovernorState {
    ledger: UsageLedger,
    alerts: AlertLog,
}

/// Process-wide spend tracker and pre-flight gate.
///
/// All state lives behind one mutex that is never held across an await.
pub struct BudgetGovernor {
    config: BudgetConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<GovernorState>,
}

impl std::fmt::Debug for BudgetGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetGovernor")
            .field("config", &self.config)
            .finish()
    }
}

impl BudgetGovernor {
    /// Create a governor with an empty ledger.
    pub fn new(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(GovernorState::default()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Decide whether a call with the given estimate may proceed.
    ///
    /// Never mutates the ledger. May raise alerts.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn check_budget(
        &self,
        provider: &str,
        model: &str,
        estimated_tokens: u64,
        estimated_cost: f64,
    ) -> BudgetCheck {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let (exceeded_periods, alerts) = self.evaluate(&mut state, now, estimated_cost);

        let allowed = !(self.config.hard_limit && !exceeded_periods.is_empty());
        if !allowed {
            warn!(
                provider,
                model,
                estimated_tokens,
                estimated_cost,
                periods = ?exceeded_periods,
                "budget: call blocked by hard limit"
            );
        } else {
            debug!(
                provider,
                model,
                estimated_tokens,
                estimated_cost,
                "budget: call allowed"
            );
        }

        BudgetCheck {
            allowed,
            exceeded_periods,
            alerts,
        }
    }

    /// Append a completed call to the ledger and re-evaluate alerts.
    ///
    /// Returns the alerts raised by the updated totals.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn record_usage(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> Vec<BudgetAlert> {
        let now = self.clock.now();
        let retention = chrono::Duration::days(i64::from(self.config.retention_days));
        let mut state = self.state.lock();
        state.ledger.append(
            UsageRecord {
                provider: provider.to_string(),
                model: model.to_string(),
                input_tokens,
                output_tokens,
                cost,
                timestamp: now,
            },
            retention,
        );
        debug!(provider, model, input_tokens, output_tokens, cost, "budget: usage recorded");

        let (_, alerts) = self.evaluate(&mut state, now, 0.0);
        for period in BudgetPeriod::ALL {
            metrics::set_budget_spend(period.as_str(), state.ledger.period_usage(period, now));
        }
        alerts
    }

    /// Clear usage accumulated in `period` and raise a reset alert.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn reset_period(&self, period: BudgetPeriod) -> BudgetAlert {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let previous = state.ledger.period_usage(period, now);
        state.ledger.reset(period, now);
        metrics::set_budget_spend(period.as_str(), 0.0);
        info!(period = %period, previous, "budget: period reset");

        let message = format!("{period} budget reset (previous usage ${previous:.4})");
        let alert = state.alerts.emit(
            AlertSeverity::Reset,
            period,
            message.clone(),
            now,
            self.cooldown(),
        );
        // Reset alerts bypass the cooldown, so `emit` always returns one.
        alert.unwrap_or(BudgetAlert {
            id: Uuid::new_v4(),
            severity: AlertSeverity::Reset,
            period,
            message,
            created_at: now,
            acknowledged: false,
        })
    }

    /// Current spend for `period`.
    pub fn status(&self, period: BudgetPeriod) -> BudgetPeriodStatus {
        let now = self.clock.now();
        let state = self.state.lock();
        BudgetPeriodStatus {
            period,
            used_amount: state.ledger.period_usage(period, now),
            limit_amount: self.config.limit_for(period),
            reset_at: period.reset_at(now),
        }
    }

    /// Alerts not yet acknowledged, oldest first.
    pub fn active_alerts(&self) -> Vec<BudgetAlert> {
        self.state.lock().alerts.active()
    }

    /// Mark an alert as acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::AlertNotFound`] if the id is unknown.
    pub fn acknowledge_alert(&self, id: Uuid) -> Result<(), BudgetError> {
        if self.state.lock().alerts.acknowledge(id) {
            Ok(())
        } else {
            Err(BudgetError::AlertNotFound(id))
        }
    }

    /// Spend on one model in the current UTC day.
    pub fn model_spend_today(&self, provider: &str, model: &str) -> f64 {
        let now = self.clock.now();
        self.state.lock().ledger.model_daily_usage(provider, model, now)
    }

    /// Whether `model` is at or over its per-model daily budget, or the
    /// catalog-wide daily budget is spent. Without a global cap the
    /// governor's own daily limit stands in.
    pub fn is_model_over_budget(&self, model: &ModelDescriptor, global: &GlobalLimits) -> bool {
        let now = self.clock.now();
        let state = self.state.lock();

        if let Some(cap) = model.per_model_daily_budget {
            let spent = state
                .ledger
                .model_daily_usage(&model.provider, &model.model_name, now);
            if spent >= cap {
                return true;
            }
        }

        let global_cap = global.daily_budget.unwrap_or(self.config.daily_limit);
        state.ledger.period_usage(BudgetPeriod::Daily, now) >= global_cap
    }

    fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.config.alert_cooldown_s).unwrap_or(i64::MAX / 1000),
        )
    }

    /// Compare `used + extra` to each limit; emit alerts for crossings.
    fn evaluate(
        &self,
        state: &mut GovernorState,
        now: DateTime<Utc>,
        extra: f64,
    ) -> (Vec<BudgetPeriod>, Vec<BudgetAlert>) {
        let cooldown = self.cooldown();
        let mut exceeded = Vec::new();
        let mut raised = Vec::new();

        for period in BudgetPeriod::ALL {
            let limit = self.config.limit_for(period);
            let used = state.ledger.period_usage(period, now);
            let projected = used + extra;

            let alert = if projected > limit {
                exceeded.push(period);
                state.alerts.emit(
                    AlertSeverity::LimitExceeded,
                    period,
                    format!("{period} budget exceeded: ${projected:.4} of ${limit:.2}"),
                    now,
                    cooldown,
                )
            } else if limit > 0.0
                && projected / limit * 100.0 >= self.config.warning_threshold_percent
            {
                state.alerts.emit(
                    AlertSeverity::Warning,
                    period,
                    format!(
                        "{period} budget at {:.1}% (${projected:.4} of ${limit:.2})",
                        projected / limit * 100.0
                    ),
                    now,
                    cooldown,
                )
            } else {
                None
            };

            if let Some(alert) = alert {
                warn!(
                    period = %period,
                    severity = ?alert.severity,
                    message = %alert.message,
                    "budget: alert raised"
                );
                raised.push(alert);
            }
        }

        (exceeded, raised)
    }
}
