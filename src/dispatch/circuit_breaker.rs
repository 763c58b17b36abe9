//! Per-provider circuit breakers.
//!
//! ## Phases
//! - **Closed**: calls flow through
//! - **Open**: calls are rejected until the cooldown has elapsed since the
//!   last failure
//! - **Half-Open**: exactly one trial call is admitted; its outcome closes or
//!   reopens the breaker
//!
//! Every provider gets its own breaker on first use. State is mutated through
//! one short `parking_lot` critical section and never held across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{to_chrono, Clock};
use crate::metrics;

/// Breaker phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Calls flow through normally.
    #[default]
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// One trial call is allowed through to test recovery.
    HalfOpen,
}

impl CircuitPhase {
    /// Value exported on the `orchestrator_circuit_phase` gauge.
    pub fn gauge_value(self) -> i64 {
        match self {
            CircuitPhase::Closed => 0,
            CircuitPhase::HalfOpen => 1,
            CircuitPhase::Open => 2,
        }
    }
}

/// Health snapshot of one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Exhausted dispatches since the last success.
    pub consecutive_failures: u32,
    /// When the most recent exhausted dispatch failed.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Current phase.
    pub phase: CircuitPhase,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed.
    Normal,
    /// The single half-open trial.
    Trial,
}

#[derive(Debug, Default)]
struct Entry {
    state: CircuitBreakerState,
    trial_started: Option<DateTime<Utc>>,
}

/// Registry of breakers keyed by provider name.
pub struct CircuitBreakers {
    failure_threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for CircuitBreakers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakers")
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl CircuitBreakers {
    /// Create an empty registry.
    ///
    /// A `failure_threshold` of 0 is treated as 1.
    pub fn new(failure_threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether a call to `provider` may proceed.
    ///
    /// Returns `None` when the breaker rejects the call. An open breaker
    /// whose cooldown has elapsed moves to half-open and admits the caller as
    /// the trial. While a trial is outstanding further calls are rejected,
    /// unless the trial has been outstanding for a whole cooldown, in which
    /// case it is presumed lost and a new trial is admitted.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn admit(&self, provider: &str) -> Option<Admission> {
        let now = self.clock.now();
        let cooldown = to_chrono(self.cooldown);
        let mut entries = self.entries.lock();
        let entry = entries.entry(provider.to_string()).or_default();

        match entry.state.phase {
            CircuitPhase::Closed => Some(Admission::Normal),
            CircuitPhase::Open => {
                let elapsed = entry
                    .state
                    .last_failure_time
                    .map_or(true, |at| now - at >= cooldown);
                if !elapsed {
                    debug!(provider, "circuit breaker: call rejected (open)");
                    return None;
                }
                entry.state.phase = CircuitPhase::HalfOpen;
                entry.trial_started = Some(now);
                metrics::set_circuit_phase(provider, CircuitPhase::HalfOpen.gauge_value());
                info!(provider, "circuit breaker: half-open, admitting trial call");
                Some(Admission::Trial)
            }
            CircuitPhase::HalfOpen => {
                let stale = entry.trial_started.map_or(true, |at| now - at >= cooldown);
                if stale {
                    entry.trial_started = Some(now);
                    info!(provider, "circuit breaker: previous trial lost, admitting new trial");
                    Some(Admission::Trial)
                } else {
                    debug!(provider, "circuit breaker: call rejected (trial in flight)");
                    None
                }
            }
        }
    }

    /// Record a successful call: back to closed with zero failures.
    pub fn record_success(&self, provider: &str) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(provider.to_string()).or_default();
        let was = entry.state.phase;
        entry.state.consecutive_failures = 0;
        entry.state.phase = CircuitPhase::Closed;
        entry.trial_started = None;
        if was != CircuitPhase::Closed {
            metrics::set_circuit_phase(provider, CircuitPhase::Closed.gauge_value());
            info!(provider, from = ?was, "circuit breaker: closed (provider recovered)");
        }
    }

    /// Record one exhausted dispatch.
    ///
    /// Opens the breaker when the failure count reaches the threshold, and
    /// reopens it when a half-open trial fails.
    pub fn record_failure(&self, provider: &str) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(provider.to_string()).or_default();
        let state = &mut entry.state;

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_time = Some(now);

        warn!(
            provider,
            failures = state.consecutive_failures,
            threshold = self.failure_threshold,
            phase = ?state.phase,
            "circuit breaker: failure recorded"
        );

        let opens = match state.phase {
            CircuitPhase::HalfOpen => true,
            CircuitPhase::Closed => state.consecutive_failures >= self.failure_threshold,
            CircuitPhase::Open => false,
        };
        if opens {
            state.phase = CircuitPhase::Open;
            entry.trial_started = None;
            metrics::set_circuit_phase(provider, CircuitPhase::Open.gauge_value());
            warn!(provider, "circuit breaker: opened");
        }
    }

    /// Give back a trial admission whose call never reached the provider.
    ///
    /// The breaker stays half-open with no trial outstanding, so the next
    /// caller is admitted as the trial. No-op unless the breaker is
    /// half-open.
    pub fn release_trial(&self, provider: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(provider) else {
            return;
        };
        if entry.state.phase == CircuitPhase::HalfOpen && entry.trial_started.take().is_some() {
            debug!(provider, "circuit breaker: trial released without a call");
        }
    }

    /// Snapshot of one provider's breaker. Unknown providers read as closed.
    pub fn state(&self, provider: &str) -> CircuitBreakerState {
        self.entries
            .lock()
            .get(provider)
            .map(|e| e.state.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every breaker created so far, ordered by provider.
    pub fn states(&self) -> BTreeMap<String, CircuitBreakerState> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.state.clone()))
            .collect()
    }
}
