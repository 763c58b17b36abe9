//! # Stage: Orchestrator Facade
//!
//! ## Responsibility
//! Own one instance of every component (catalog, budget governor, routing
//! engine, dispatcher, workflow executor, execution registry) and expose the
//! upward interface: single routed calls, workflow runs, budget
//! administration, dispatch statistics, and execution cancellation.
//!
//! ## Guarantees
//! - One governor, one breaker table, one queue per orchestrator: every call
//!   path shares them
//! - Every single call and workflow run appears in `active_executions()`
//!   until it finishes
//! - Catalog reloads apply to the next routing decision, never mid-call
//!
//! ## NOT Responsible For
//! - Loading the config file (see `config::loader`)
//! - Provider credentials (see `provider`)

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::budget::{BudgetAlert, BudgetGovernor, BudgetPeriod, BudgetPeriodStatus};
use crate::caller::ModelCaller;
use crate::catalog::{Catalog, CatalogHandle};
use crate::clock::{Clock, TokioClock};
use crate::config::OrchestratorConfig;
use crate::dispatch::{CircuitBreakerState, Dispatcher, Priority};
use crate::provider::{GenerationRequest, ProviderRegistry};
use crate::routing::{RoutingEngine, RoutingError, RoutingRequest};
use crate::workflow::{
    ExecutionInfo, ExecutionKind, ExecutionRegistry, WorkflowExecutor, WorkflowPreferences,
    WorkflowResult,
};
use crate::OrchestratorError;

/// A single routed generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Prompt text sent to the model.
    pub prompt: String,
    /// Where to send it.
    pub routing: RoutingRequest,
    /// Urgency; at or above the dispatcher's threshold the call skips the queue.
    #[serde(default)]
    pub priority: Priority,
    /// Completion cap; clamped to the model's own maximum.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl DispatchRequest {
    /// Normal-priority request with model-default generation settings.
    pub fn new(prompt: impl Into<String>, routing: RoutingRequest) -> Self {
        Self {
            prompt: prompt.into(),
            routing,
            priority: Priority::Normal,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    fn payload(&self) -> GenerationRequest {
        let mut payload = GenerationRequest::new(self.prompt.clone());
        if let Some(max_tokens) = self.max_tokens {
            payload = payload.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            payload = payload.with_temperature(temperature);
        }
        payload
    }
}

/// Result of [`Orchestrator::route_and_dispatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    /// Generated code or text.
    pub code: String,
    /// Provider that served the call.
    pub provider: String,
    /// Model that served the call.
    pub model: String,
    /// Why that model was chosen.
    pub reason: String,
    /// Pre-flight token estimate.
    pub estimated_tokens: u64,
    /// Pre-flight cost estimate in USD.
    pub estimated_cost: f64,
    /// Alerts raised while checking and recording spend.
    pub budget_alerts: Vec<BudgetAlert>,
}

/// Snapshot of the dispatch layer, see [`Orchestrator::optimization_stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationStats {
    /// Units waiting in the pending queue.
    pub queue_length: usize,
    /// Breaker state per provider that has been called.
    pub circuit_breaker_states: BTreeMap<String, CircuitBreakerState>,
    /// Largest batch drained per key.
    pub max_batch_size: usize,
    /// Attempts per call.
    pub max_retries: u32,
}

/// Entry point wiring every component together.
///
/// Cheap to clone; clones share all state.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    catalog: CatalogHandle,
    budget: Arc<BudgetGovernor>,
    caller: ModelCaller,
    workflows: WorkflowExecutor,
    executions: Arc<ExecutionRegistry>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    /// Build an orchestrator from `config` using `providers` for calls and
    /// `clock` for time.
    ///
    /// The config is assumed to be validated (see `config::loader`).
    pub fn new(
        config: OrchestratorConfig,
        providers: ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let catalog = CatalogHandle::new(config.catalog.clone());
        let budget = Arc::new(BudgetGovernor::new(config.budget.clone(), Arc::clone(&clock)));
        let router = RoutingEngine::new(catalog.clone(), Arc::clone(&budget));
        let dispatcher = Dispatcher::new(config.dispatch.clone(), providers, Arc::clone(&clock));
        let caller = ModelCaller::new(router, dispatcher, Arc::clone(&budget));
        let executions = Arc::new(ExecutionRegistry::new());
        let workflows = WorkflowExecutor::new(
            caller.clone(),
            Arc::clone(&executions),
            Arc::clone(&clock),
            config.workflow.clone(),
        );

        info!(
            target: "orchestrator::startup",
            models = config.catalog.models.len(),
            providers = config.catalog.providers().len(),
            hard_limit = config.budget.hard_limit,
            "orchestrator ready"
        );

        Self {
            config: Arc::new(config),
            catalog,
            budget,
            caller,
            workflows,
            executions,
            clock,
        }
    }

    /// Build an orchestrator on the Tokio clock.
    pub fn from_config(config: OrchestratorConfig, providers: ProviderRegistry) -> Self {
        Self::new(config, providers, Arc::new(TokioClock))
    }

    /// The configuration this orchestrator was built from.
    ///
    /// `catalog` reflects the startup table; see [`Orchestrator::catalog`]
    /// for the live one.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.snapshot()
    }

    /// Routing request built from `[routing]` and the live catalog.
    ///
    /// # Errors
    ///
    /// [`RoutingError::NoModelAvailable`] when no default provider is
    /// configured and the catalog is empty.
    pub fn default_routing(&self) -> Result<RoutingRequest, OrchestratorError> {
        let provider = self
            .config
            .routing
            .default_provider
            .clone()
            .or_else(|| self.catalog.snapshot().providers().into_iter().next())
            .ok_or_else(|| RoutingError::NoModelAvailable {
                provider: String::new(),
                reason: "catalog is empty and no default provider is configured".into(),
            })?;
        Ok(RoutingRequest::preferred(provider, self.config.routing.allow_failover))
    }

    /// Route one request, dispatch it, and record its spend.
    ///
    /// # Errors
    ///
    /// Routing, budget-veto and dispatch failures, see [`ModelCaller::call`].
    pub async fn route_and_dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchResult, OrchestratorError> {
        let execution_id =
            self.executions
                .register(ExecutionKind::Dispatch, &request.prompt, self.clock.now());
        let span = tracing::info_span!(
            "orchestrator.dispatch",
            execution_id = %execution_id,
            provider = %request.routing.target.provider(),
            priority = ?request.priority,
        );

        let outcome = self
            .caller
            .call(&request.routing, request.payload(), request.priority)
            .instrument(span)
            .await;
        self.executions.complete(execution_id);

        let call = outcome?;
        Ok(DispatchResult {
            code: call.response,
            provider: call.decision.selected_provider,
            model: call.decision.selected_model,
            reason: call.decision.reason,
            estimated_tokens: call.estimated_tokens,
            estimated_cost: call.estimated_cost,
            budget_alerts: call.budget_alerts,
        })
    }

    /// Run a workflow graph for `user_prompt`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Workflow`] when the run cannot start (empty
    /// prompt, invalid custom graph). Node failures are reported in the
    /// result, not here.
    pub async fn run_workflow(
        &self,
        user_prompt: &str,
        preferences: &WorkflowPreferences,
    ) -> Result<WorkflowResult, OrchestratorError> {
        Ok(self.workflows.run(user_prompt, preferences).await?)
    }

    /// Spend in `period`'s current window.
    pub fn budget_status(&self, period: BudgetPeriod) -> BudgetPeriodStatus {
        self.budget.status(period)
    }

    /// Unacknowledged alerts, oldest first.
    pub fn active_alerts(&self) -> Vec<BudgetAlert> {
        self.budget.active_alerts()
    }

    /// Acknowledge an alert.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Budget`] if no alert has this id.
    pub fn acknowledge_alert(&self, id: Uuid) -> Result<(), OrchestratorError> {
        Ok(self.budget.acknowledge_alert(id)?)
    }

    /// Administratively reset `period`; returns the RESET alert.
    pub fn reset_period(&self, period: BudgetPeriod) -> BudgetAlert {
        self.budget.reset_period(period)
    }

    /// Queue, breaker and batching figures.
    pub fn optimization_stats(&self) -> OptimizationStats {
        let dispatcher = self.caller.dispatcher();
        OptimizationStats {
            queue_length: dispatcher.queue_length(),
            circuit_breaker_states: dispatcher.circuit_breaker_states(),
            max_batch_size: dispatcher.config().max_batch_size,
            max_retries: dispatcher.config().max_retries,
        }
    }

    /// Executions still running, oldest first.
    pub fn active_executions(&self) -> Vec<ExecutionInfo> {
        self.executions.list()
    }

    /// Stop a workflow from issuing further nodes. In-flight calls finish.
    ///
    /// Returns `false` if the id is not active.
    pub fn cancel_execution(&self, id: Uuid) -> bool {
        self.executions.cancel(id)
    }

    /// Swap the model catalog for subsequent routing decisions.
    pub fn reload_catalog(&self, catalog: Catalog) {
        self.catalog.reload(catalog);
    }

    /// The shared budget governor.
    pub fn budget(&self) -> &Arc<BudgetGovernor> {
        &self.budget
    }

    /// The shared dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        self.caller.dispatcher()
    }
}
