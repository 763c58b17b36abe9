//! # Stage: Declarative Orchestrator Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload the TOML file that configures dispatch,
//! budgets, the model catalog, routing defaults, workflows and logging:
//! ```text
//! codegen-orchestrator orchestrator.toml "build a CLI todo app"
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Defaulted: every section and optional field has a named default, so an
//!   empty file is a valid (if catalog-less) config
//! - Hot-reloadable: file changes are detected and validated before applying
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building components from config (that belongs to `orchestrator`)
//! - Provider credentials (read from the environment by `provider`)

pub mod loader;
pub mod validation;
pub mod watcher;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::budget::BudgetConfig;
use crate::catalog::Catalog;
use crate::dispatch::DispatchConfig;
use crate::workflow::WorkflowConfig;

pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

/// Default failover policy: enabled.
fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration of an orchestrator instance.
///
/// # Example
///
/// ```toml
/// [dispatch]
/// max_retries = 3
/// high_priority_threshold = "high"
///
/// [budget]
/// daily_limit = 5.0
/// hard_limit = true
///
/// [catalog.global]
/// daily_budget = 5.0
///
/// [[catalog.models]]
/// provider = "openai"
/// model_name = "gpt-4o-mini"
/// input_cost_per_1k = 0.00015
/// output_cost_per_1k = 0.0006
/// capabilities = ["code", "fallback"]
/// routing_priority = 1
///
/// [routing]
/// default_provider = "openai"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorConfig {
    /// Retry, batching and circuit-breaker settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Spend limits and alerting.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Model table and global limits.
    #[serde(default)]
    pub catalog: Catalog,
    /// Default routing context.
    #[serde(default)]
    pub routing: RoutingDefaults,
    /// Workflow defaults.
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Routing defaults ─────────────────────────────────────────────────────

/// Routing context used when a caller does not supply one.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingDefaults {
    /// Preferred provider. `None` picks the first provider in the catalog.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Allow a degraded pick when every model is over budget.
    #[serde(default = "default_true")]
    pub allow_failover: bool,
}

impl Default for RoutingDefaults {
    fn default() -> Self {
        Self {
            default_provider: None,
            allow_failover: true,
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability configuration: logging and metrics.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format. `LOG_FORMAT` in the environment takes precedence.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Register Prometheus metrics at startup.
    #[serde(default)]
    pub metrics_enabled: bool,
}

/// Log output format.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// Parse a `LOG_FORMAT` value; anything but `json` is pretty.
    pub fn from_env_value(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Export the JSON Schema for `OrchestratorConfig`.
///
/// This enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}
