//! Prometheus metrics for routing, dispatch, budget and workflow execution.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. Every helper below is a
//! no-op until then, so components can record unconditionally and tests never
//! need a registry.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `orchestrator_dispatch_total` | Counter | `provider`, `outcome` |
//! | `orchestrator_dispatch_attempts_total` | Counter | `provider` |
//! | `orchestrator_call_duration_seconds` | Histogram | `provider` |
//! | `orchestrator_queue_depth` | Gauge | (none) |
//! | `orchestrator_circuit_phase` | Gauge | `provider` (0 closed, 1 half-open, 2 open) |
//! | `orchestrator_budget_spend_usd` | Gauge | `period` |
//! | `orchestrator_workflow_nodes_total` | Counter | `step`, `status` |

use crate::OrchestratorError;
use prometheus::{
    core::Collector, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All orchestrator metrics, registered with one private registry.
pub struct Metrics {
    /// Registry that owns every descriptor below.
    pub registry: Registry,
    /// Final dispatch outcomes per provider.
    pub dispatch_total: CounterVec,
    /// Individual provider call attempts, including retries.
    pub attempts_total: CounterVec,
    /// Provider call latency.
    pub call_duration: HistogramVec,
    /// Units waiting in the dispatch queue.
    pub queue_depth: IntGauge,
    /// Circuit breaker phase per provider.
    pub circuit_phase: IntGaugeVec,
    /// Spend in the current window per budget period.
    pub budget_spend: GaugeVec,
    /// Workflow node outcomes per step type.
    pub workflow_nodes: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    collector: Result<C, prometheus::Error>,
) -> Result<C, OrchestratorError> {
    let collector =
        collector.map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics. A second call is a no-op.
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if a descriptor cannot be built or
/// registered.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let dispatch_total = register(
        &registry,
        CounterVec::new(
            Opts::new("orchestrator_dispatch_total", "Dispatch outcomes"),
            &["provider", "outcome"],
        ),
    )?;
    let attempts_total = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "orchestrator_dispatch_attempts_total",
                "Provider call attempts including retries",
            ),
            &["provider"],
        ),
    )?;
    let call_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "orchestrator_call_duration_seconds",
                "Provider call latency",
            ),
            &["provider"],
        ),
    )?;
    let queue_depth = register(
        &registry,
        IntGauge::new("orchestrator_queue_depth", "Units waiting in the dispatch queue"),
    )?;
    let circuit_phase = register(
        &registry,
        IntGaugeVec::new(
            Opts::new(
                "orchestrator_circuit_phase",
                "Circuit breaker phase (0 closed, 1 half-open, 2 open)",
            ),
            &["provider"],
        ),
    )?;
    let budget_spend = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "orchestrator_budget_spend_usd",
                "Spend in the current budget window",
            ),
            &["period"],
        ),
    )?;
    let workflow_nodes = register(
        &registry,
        CounterVec::new(
            Opts::new("orchestrator_workflow_nodes_total", "Workflow node outcomes"),
            &["step", "status"],
        ),
    )?;

    // A racing initialiser builds identical descriptors; either bundle is fine.
    let _ = METRICS.set(Metrics {
        registry,
        dispatch_total,
        attempts_total,
        call_duration,
        queue_depth,
        circuit_phase,
        budget_spend,
        workflow_nodes,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a final dispatch outcome (`ok`, `provider_error`, `timeout`,
/// `circuit_open`, ...).
pub fn inc_dispatch(provider: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.dispatch_total.get_metric_with_label_values(&[provider, outcome]) {
            c.inc();
        }
    }
}

/// Count one provider call attempt.
pub fn inc_attempt(provider: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.attempts_total.get_metric_with_label_values(&[provider]) {
            c.inc();
        }
    }
}

/// Record the latency of one provider call attempt.
pub fn record_call_latency(provider: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.call_duration.get_metric_with_label_values(&[provider]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Set the dispatch queue depth.
pub fn set_queue_depth(depth: usize) {
    if let Some(m) = metrics() {
        m.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }
}

/// Set a provider's circuit phase gauge.
pub fn set_circuit_phase(provider: &str, phase: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.circuit_phase.get_metric_with_label_values(&[provider]) {
            g.set(phase);
        }
    }
}

/// Set the spend gauge for a budget period.
pub fn set_budget_spend(period: &str, usd: f64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.budget_spend.get_metric_with_label_values(&[period]) {
            g.set(usd);
        }
    }
}

/// Count a workflow node outcome (`succeeded`, `failed`, `skipped`).
pub fn inc_workflow_node(step: &str, status: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.workflow_nodes.get_metric_with_label_values(&[step, status]) {
            c.inc();
        }
    }
}

/// Gather all registered metric families. Empty before [`init_metrics`].
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics are not initialised or encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
