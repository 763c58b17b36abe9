//! # Stage: Dispatch Layer
//!
//! ## Responsibility
//! Execute a (model, payload, priority) unit against its provider: either
//! directly (high priority) or through the pending queue, which a background
//! drain groups into per-(provider, model) batches. Every call is retried
//! with exponential backoff and guarded by a per-provider circuit breaker.
//!
//! ## Guarantees
//! - Fail-fast: an open breaker rejects the call before any work is queued
//! - Bounded: at most `max_retries` attempts per unit; at most one drain pass
//!   is active at a time
//! - Ordered: within a batch, descending priority, ties in enqueue order
//! - Exactly one result per unit; the unit leaves the queue before its result
//!   is delivered
//! - One breaker failure per exhausted unit, not one per attempt
//!
//! ## NOT Responsible For
//! - Choosing a model (see `routing`)
//! - Spend accounting (see `budget`)
//! - Exactly-once delivery to the provider

pub mod circuit_breaker;
pub mod queue;
pub mod retry;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::catalog::ModelDescriptor;
use crate::clock::Clock;
use crate::metrics;
use crate::provider::{GenerationRequest, ProviderClient, ProviderRegistry};

pub use circuit_breaker::{Admission, CircuitBreakerState, CircuitBreakers, CircuitPhase};
pub use queue::{form_batches, PendingQueue, Priority, QueuedUnit};
pub use retry::{AttemptError, RetryExhausted, RetryPolicy};

// ── Default value functions ────────────────────────────────────────────

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_max_batch_size() -> usize {
    5
}

fn default_batch_window_ms() -> u64 {
    100
}

fn default_high_priority_threshold() -> Priority {
    Priority::High
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_queue_capacity() -> usize {
    1000
}

// ── Config ─────────────────────────────────────────────────────────────

/// Retry, batching and circuit-breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DispatchConfig {
    /// Total attempts per unit, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff after the first failed attempt; doubles every attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Deadline of each provider call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Most units executed together per (provider, model) key.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Delay before each drain pass so concurrent submitters coalesce.
    /// 0 drains immediately.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Priorities at or above this bypass the queue.
    #[serde(default = "default_high_priority_threshold")]
    pub high_priority_threshold: Priority,
    /// Consecutive exhausted units that open a provider's breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open breaker waits before admitting a trial call.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Most units the queue holds.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            max_batch_size: default_max_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            high_priority_threshold: default_high_priority_threshold(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl DispatchConfig {
    /// Retry policy derived from this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

/// Errors returned by [`Dispatcher::dispatch`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// The provider's breaker is open (or its half-open trial is in flight).
    #[error("circuit open for provider {provider}")]
    CircuitOpen {
        /// Provider whose breaker rejected the call.
        provider: String,
    },

    /// Every attempt failed; the last failure came from the provider.
    #[error("provider {provider}/{model} failed after {attempts} attempts: {message}")]
    ProviderError {
        /// Provider name.
        provider: String,
        /// Model name.
        model: String,
        /// Attempts made.
        attempts: u32,
        /// Final failure.
        message: String,
    },

    /// Every attempt failed; the last one outlived its deadline.
    #[error(
        "provider {provider}/{model} timed out after {attempts} attempts ({timeout_ms}ms each)"
    )]
    Timeout {
        /// Provider name.
        provider: String,
        /// Model name.
        model: String,
        /// Attempts made.
        attempts: u32,
        /// Per-attempt deadline.
        timeout_ms: u64,
    },

    /// No client is registered for the provider.
    #[error("no client registered for provider {0}")]
    UnknownProvider(String),

    /// The pending queue is at capacity.
    #[error("dispatch queue full ({capacity} units); rejected {provider}/{model}")]
    QueueFull {
        /// Provider name.
        provider: String,
        /// Model name.
        model: String,
        /// Configured capacity.
        capacity: usize,
    },

    /// The result handle was dropped before a result was delivered.
    #[error("dispatch of {provider}/{model} was cancelled")]
    Cancelled {
        /// Provider name.
        provider: String,
        /// Model name.
        model: String,
    },
}

impl DispatchError {
    /// Short label used for the `outcome` metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            DispatchError::CircuitOpen { .. } => "circuit_open",
            DispatchError::ProviderError { .. } => "provider_error",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::UnknownProvider(_) => "unknown_provider",
            DispatchError::QueueFull { .. } => "queue_full",
            DispatchError::Cancelled { .. } => "cancelled",
        }
    }

    fn exhausted(model: &ModelDescriptor, exhausted: RetryExhausted) -> Self {
        match exhausted.last {
            AttemptError::Timeout(d) => DispatchError::Timeout {
                provider: model.provider.clone(),
                model: model.model_name.clone(),
                attempts: exhausted.attempts,
                timeout_ms: d.as_millis() as u64,
            },
            AttemptError::Provider(e) => DispatchError::ProviderError {
                provider: model.provider.clone(),
                model: model.model_name.clone(),
                attempts: exhausted.attempts,
                message: e.to_string(),
            },
        }
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────────

struct Inner {
    config: DispatchConfig,
    policy: RetryPolicy,
    providers: ProviderRegistry,
    breakers: CircuitBreakers,
    queue: PendingQueue,
    draining: AtomicBool,
    clock: Arc<dyn Clock>,
}

/// Queueing, batching, retrying, circuit-breaking executor.
///
/// Cheap to clone; clones share the queue and breakers.
///
/// # Panics
///
/// This type never panics.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("providers", &self.inner.providers)
            .field("queue_length", &self.inner.queue.len())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher over the given provider clients.
    pub fn new(config: DispatchConfig, providers: ProviderRegistry, clock: Arc<dyn Clock>) -> Self {
        let breakers = CircuitBreakers::new(
            config.failure_threshold,
            Duration::from_millis(config.cooldown_ms),
            Arc::clone(&clock),
        );
        Self {
            inner: Arc::new(Inner {
                policy: config.retry_policy(),
                queue: PendingQueue::new(config.queue_capacity),
                config,
                providers,
                breakers,
                draining: AtomicBool::new(false),
                clock,
            }),
        }
    }

    /// Execute one unit and return the provider's raw response.
    ///
    /// Units at or above `high_priority_threshold` run directly; all others
    /// are queued and resolved by a drain pass.
    ///
    /// # Errors
    ///
    /// See [`DispatchError`].
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn dispatch(
        &self,
        model: &ModelDescriptor,
        payload: GenerationRequest,
        priority: Priority,
    ) -> Result<String, DispatchError> {
        let provider = model.provider.as_str();

        let Some(client) = self.inner.providers.get(provider) else {
            metrics::inc_dispatch(provider, "unknown_provider");
            return Err(DispatchError::UnknownProvider(provider.to_string()));
        };

        let Some(admission) = self.inner.breakers.admit(provider) else {
            metrics::inc_dispatch(provider, "circuit_open");
            return Err(DispatchError::CircuitOpen {
                provider: provider.to_string(),
            });
        };

        if priority >= self.inner.config.high_priority_threshold {
            let span = tracing::info_span!(
                "dispatch.direct",
                provider = %provider,
                model = %model.model_name,
                priority = ?priority,
                trial = admission == Admission::Trial,
            );
            return self
                .inner
                .execute(&client, model, &payload)
                .instrument(span)
                .await;
        }

        let (tx, rx) = oneshot::channel();
        let unit = QueuedUnit {
            id: Uuid::new_v4(),
            sequence: self.inner.queue.next_sequence(),
            model: model.clone(),
            payload,
            priority,
            enqueued_at: self.inner.clock.now(),
            admission,
            respond_to: tx,
        };

        if let Err(rejected) = self.inner.queue.push(unit) {
            if rejected.admission == Admission::Trial {
                self.inner.breakers.release_trial(provider);
            }
            metrics::inc_dispatch(provider, "queue_full");
            warn!(
                target: "orchestrator::dispatch",
                provider,
                model = %model.model_name,
                capacity = self.inner.config.queue_capacity,
                "dispatch: queue full"
            );
            return Err(DispatchError::QueueFull {
                provider: provider.to_string(),
                model: model.model_name.clone(),
                capacity: self.inner.config.queue_capacity,
            });
        }

        self.schedule_drain();

        rx.await.unwrap_or_else(|_| {
            Err(DispatchError::Cancelled {
                provider: provider.to_string(),
                model: model.model_name.clone(),
            })
        })
    }

    /// Units waiting in the queue.
    pub fn queue_length(&self) -> usize {
        self.inner.queue.len()
    }

    /// Snapshot of every provider's breaker.
    pub fn circuit_breaker_states(&self) -> BTreeMap<String, CircuitBreakerState> {
        self.inner.breakers.states()
    }

    /// Snapshot of one provider's breaker.
    pub fn circuit_breaker_state(&self, provider: &str) -> CircuitBreakerState {
        self.inner.breakers.state(provider)
    }

    /// Active configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    /// Whether a drain pass is scheduled or running.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    fn schedule_drain(&self) {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.drain_pass().await });
    }

    async fn drain_pass(self) {
        if self.inner.config.batch_window_ms > 0 {
            self.inner
                .clock
                .sleep(Duration::from_millis(self.inner.config.batch_window_ms))
                .await;
        }

        let batches = self.inner.queue.take_batches(self.inner.config.max_batch_size);
        let units: usize = batches.iter().map(Vec::len).sum();
        debug!(
            target: "orchestrator::dispatch",
            batches = batches.len(),
            units,
            "dispatch: drain pass"
        );

        join_all(batches.into_iter().map(|batch| self.inner.run_batch(batch))).await;

        self.inner.draining.store(false, Ordering::Release);
        if !self.inner.queue.is_empty() {
            self.schedule_drain();
        }
    }
}

impl Inner {
    async fn run_batch(&self, batch: Vec<QueuedUnit>) {
        let Some(first) = batch.first() else {
            return;
        };
        let span = tracing::info_span!(
            "dispatch.batch",
            provider = %first.model.provider,
            model = %first.model.model_name,
            size = batch.len(),
        );

        join_all(batch.into_iter().map(|unit| self.run_unit(unit)))
            .instrument(span)
            .await;
    }

    async fn run_unit(&self, unit: QueuedUnit) {
        if unit.respond_to.is_closed() {
            debug!(unit_id = %unit.id, "dispatch: caller gone, skipping unit");
            if unit.admission == Admission::Trial {
                self.breakers.release_trial(&unit.model.provider);
            }
            return;
        }

        let result = match self.providers.get(&unit.model.provider) {
            Some(client) => self.execute(&client, &unit.model, &unit.payload).await,
            None => Err(DispatchError::UnknownProvider(unit.model.provider.clone())),
        };

        if unit.respond_to.send(result).is_err() {
            debug!(unit_id = %unit.id, "dispatch: caller dropped before result delivery");
        }
    }

    async fn execute(
        &self,
        client: &Arc<dyn ProviderClient>,
        model: &ModelDescriptor,
        payload: &GenerationRequest,
    ) -> Result<String, DispatchError> {
        let provider = model.provider.as_str();
        let outcome = self
            .policy
            .run(self.clock.as_ref(), provider, || client.generate(payload, model))
            .await;

        match outcome {
            Ok(text) => {
                self.breakers.record_success(provider);
                metrics::inc_dispatch(provider, "ok");
                Ok(text)
            }
            Err(exhausted) => {
                self.breakers.record_failure(provider);
                let err = DispatchError::exhausted(model, exhausted);
                metrics::inc_dispatch(provider, err.outcome());
                info!(
                    target: "orchestrator::dispatch",
                    provider,
                    model = %model.model_name,
                    error = %err,
                    "dispatch: unit failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::provider::{EchoProvider, ProviderFailure};
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::AtomicU32;

    struct Failing {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderClient for Failing {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            _model: &ModelDescriptor,
        ) -> Result<String, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderFailure::Api {
                status: 500,
                message: "boom".into(),
            })
        }
    }

    /// Fails while `failing` is set, echoes otherwise.
    struct Flaky {
        failing: AtomicBool,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicBool::new(true),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderClient for Flaky {
        async fn generate(
            &self,
            request: &GenerationRequest,
            _model: &ModelDescriptor,
        ) -> Result<String, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderFailure::Api {
                    status: 503,
                    message: "down".into(),
                });
            }
            Ok(format!("ok: {}", request.prompt))
        }
    }

    /// Opens `p`'s breaker, waits out the cooldown and heals the provider.
    async fn half_open_dispatcher(
        config: DispatchConfig,
    ) -> (Dispatcher, Arc<Flaky>, ModelDescriptor) {
        let clock = ManualClock::default();
        let flaky = Flaky::new();
        let registry = ProviderRegistry::new().with("p", flaky.clone());
        let cooldown = Duration::from_millis(config.cooldown_ms);
        let d = Dispatcher::new(config, registry, Arc::new(clock.clone()));
        let model = ModelDescriptor::new("p", "m");
        let _ = d
            .dispatch(&model, GenerationRequest::new("x"), Priority::High)
            .await;
        assert_eq!(d.circuit_breaker_state("p").phase, CircuitPhase::Open);
        clock.advance(cooldown);
        flaky.failing.store(false, Ordering::SeqCst);
        (d, flaky, model)
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            batch_window_ms: 0,
            base_delay_ms: 10,
            failure_threshold: 2,
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_provider_is_rejected() {
        let d = Dispatcher::new(
            config(),
            ProviderRegistry::new(),
            Arc::new(ManualClock::default()),
        );
        let err = d
            .dispatch(
                &ModelDescriptor::new("nobody", "m"),
                GenerationRequest::new("hi"),
                Priority::High,
            )
            .await
            .expect_err("test: no client");
        assert_eq!(err, DispatchError::UnknownProvider("nobody".into()));
    }

    #[tokio::test]
    async fn test_direct_dispatch_returns_response() {
        let registry = ProviderRegistry::new().with("p", Arc::new(EchoProvider::new()));
        let d = Dispatcher::new(config(), registry, Arc::new(ManualClock::default()));
        let out = d
            .dispatch(
                &ModelDescriptor::new("p", "m"),
                GenerationRequest::new("hi"),
                Priority::Critical,
            )
            .await
            .expect("test: echo succeeds");
        assert_eq!(out, "[p/m] hi");
        assert_eq!(d.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_queued_dispatch_resolves_through_drain() {
        let registry = ProviderRegistry::new().with("p", Arc::new(EchoProvider::new()));
        let d = Dispatcher::new(config(), registry, Arc::new(ManualClock::default()));
        let out = d
            .dispatch(
                &ModelDescriptor::new("p", "m"),
                GenerationRequest::new("queued"),
                Priority::Low,
            )
            .await
            .expect("test: echo succeeds");
        assert_eq!(out, "[p/m] queued");
    }

    #[tokio::test]
    async fn test_exhausted_unit_counts_one_breaker_failure() {
        let failing = Arc::new(Failing {
            calls: AtomicU32::new(0),
        });
        let registry = ProviderRegistry::new().with("p", failing.clone());
        let d = Dispatcher::new(config(), registry, Arc::new(ManualClock::default()));
        let err = d
            .dispatch(&ModelDescriptor::new("p", "m"), GenerationRequest::new("x"), Priority::High)
            .await
            .expect_err("test: always fails");
        assert!(matches!(err, DispatchError::ProviderError { attempts: 3, .. }));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        assert_eq!(d.circuit_breaker_state("p").consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_calling_provider() {
        let failing = Arc::new(Failing {
            calls: AtomicU32::new(0),
        });
        let registry = ProviderRegistry::new().with("p", failing.clone());
        let d = Dispatcher::new(config(), registry, Arc::new(ManualClock::default()));
        let model = ModelDescriptor::new("p", "m");
        for _ in 0..2 {
            let _ = d.dispatch(&model, GenerationRequest::new("x"), Priority::High).await;
        }
        let before = failing.calls.load(Ordering::SeqCst);
        let err = d
            .dispatch(&model, GenerationRequest::new("x"), Priority::Normal)
            .await
            .expect_err("test: breaker open");
        assert_eq!(err, DispatchError::CircuitOpen { provider: "p".into() });
        assert_eq!(failing.calls.load(Ordering::SeqCst), before);
        assert_eq!(d.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_queued_trial_admits_next_caller() {
        let (d, flaky, model) = half_open_dispatcher(DispatchConfig {
            failure_threshold: 1,
            ..config()
        })
        .await;
        let calls_before = flaky.calls.load(Ordering::SeqCst);

        // Poll once so the trial is admitted and queued, then abandon it.
        let abandoned = d
            .dispatch(&model, GenerationRequest::new("gone"), Priority::Normal)
            .now_or_never();
        assert!(abandoned.is_none());
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(d.queue_length(), 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), calls_before);

        let out = d
            .dispatch(&model, GenerationRequest::new("next"), Priority::High)
            .await
            .expect("test: released trial admits the next caller");
        assert_eq!(out, "ok: next");
        assert_eq!(d.circuit_breaker_state("p").phase, CircuitPhase::Closed);
    }

    #[tokio::test]
    async fn test_queue_full_returns_error_and_releases_trial() {
        let (d, flaky, model) = half_open_dispatcher(DispatchConfig {
            failure_threshold: 1,
            queue_capacity: 1,
            ..config()
        })
        .await;

        // Occupy the only slot without scheduling a drain.
        let (tx, _rx) = oneshot::channel();
        let filler = QueuedUnit {
            id: Uuid::new_v4(),
            sequence: d.inner.queue.next_sequence(),
            model: model.clone(),
            payload: GenerationRequest::new("filler"),
            priority: Priority::Low,
            enqueued_at: chrono::Utc::now(),
            admission: Admission::Normal,
            respond_to: tx,
        };
        assert!(d.inner.queue.push(filler).is_ok());
        let calls_before = flaky.calls.load(Ordering::SeqCst);

        let err = d
            .dispatch(&model, GenerationRequest::new("x"), Priority::Normal)
            .await
            .expect_err("test: queue at capacity");
        assert_eq!(
            err,
            DispatchError::QueueFull {
                provider: "p".into(),
                model: "m".into(),
                capacity: 1,
            }
        );
        assert_eq!(d.circuit_breaker_state("p").phase, CircuitPhase::HalfOpen);

        let out = d
            .dispatch(&model, GenerationRequest::new("direct"), Priority::High)
            .await
            .expect("test: trial available again");
        assert_eq!(out, "ok: direct");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), calls_before + 1);
        assert_eq!(d.circuit_breaker_state("p").phase, CircuitPhase::Closed);
    }
}
