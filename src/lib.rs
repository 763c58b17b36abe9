//! # tokio-codegen-orchestrator
//!
//! Multi-provider LLM orchestration for code generation over Tokio.
//!
//! ## Architecture
//!
//! Every model call follows the same path:
//! ```text
//! RoutingRequest → RoutingEngine → BudgetGovernor::check → Dispatcher → ProviderClient
//!                  (catalog+spend)   (hard/soft limits)     (queue, batch, retry, breaker)
//! ```
//! On top of that path, a [`workflow::WorkflowExecutor`] runs a dependency
//! graph of plan → scaffold → build → validate/quality → review steps and
//! collects the generated files as artifacts. [`Orchestrator`] wires all of
//! it together from an [`config::OrchestratorConfig`].

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod budget;
pub mod caller;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod routing;
pub mod workflow;

// Re-exports for convenience
pub use budget::{BudgetAlert, BudgetError, BudgetGovernor, BudgetPeriod};
pub use catalog::{Catalog, ModelDescriptor};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{ConfigError, LogFormat, OrchestratorConfig};
pub use dispatch::{DispatchError, Dispatcher, Priority};
pub use orchestrator::{DispatchRequest, DispatchResult, OptimizationStats, Orchestrator};
pub use provider::{
    AnthropicProvider, EchoProvider, GenerationRequest, LlamaCppProvider, OpenAiProvider,
    ProviderClient, ProviderFailure, ProviderRegistry,
};
pub use routing::{RoutingDecision, RoutingError, RoutingRequest};
pub use workflow::{WorkflowError, WorkflowPreferences, WorkflowResult};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use tokio_codegen_orchestrator::{init_tracing, OrchestratorError};
/// # fn example() -> Result<(), OrchestratorError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT")
        .map(|v| LogFormat::from_env_value(&v))
        .unwrap_or_default();
    init_tracing_with_format(format)
}

/// Initialise the global tracing subscriber with an explicit format.
///
/// Used when the format comes from `[observability]` in the config file
/// rather than the environment.
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if a global subscriber is already set.
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing_with_format(format: LogFormat) -> Result<(), OrchestratorError> {
    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level orchestrator errors.
///
/// Every error surface in the crate is mapped to a variant here.
/// All variants implement `std::error::Error` via [`thiserror`].
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// No model could be selected for the request.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// The dispatch layer gave up (breaker open, retries exhausted, ...).
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Hard-limit budget enforcement vetoed the call, or an alert id was
    /// unknown.
    #[error(transparent)]
    Budget(#[from] BudgetError),

    /// A workflow could not be started.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// A configuration file failed to load or validate.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Provider and model the failure is attributed to, when known.
    ///
    /// The model is empty when only the provider is known (e.g. an open
    /// breaker or a routing miss).
    pub fn provider_and_model(&self) -> Option<(String, String)> {
        match self {
            OrchestratorError::Routing(RoutingError::NoModelAvailable { provider, .. }) => {
                Some((provider.clone(), String::new()))
            }
            OrchestratorError::Budget(BudgetError::BudgetExceeded {
                provider, model, ..
            }) => Some((provider.clone(), model.clone())),
            OrchestratorError::Dispatch(e) => Some(match e {
                DispatchError::CircuitOpen { provider } => (provider.clone(), String::new()),
                DispatchError::UnknownProvider(provider) => (provider.clone(), String::new()),
                DispatchError::ProviderError {
                    provider, model, ..
                }
                | DispatchError::Timeout {
                    provider, model, ..
                }
                | DispatchError::QueueFull {
                    provider, model, ..
                }
                | DispatchError::Cancelled { provider, model } => {
                    (provider.clone(), model.clone())
                }
            }),
            _ => None,
        }
    }
}
