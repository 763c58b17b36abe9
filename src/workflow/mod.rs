//! # Stage: Workflow Executor
//!
//! ## Responsibility
//! Run a graph of typed generation steps (plan → scaffold → build →
//! validate/quality → review by default) for one user request. Each node is
//! rendered from its template, sent through the shared call sequence, and its
//! output classified into artifacts.
//!
//! ## Guarantees
//! - Sequential: nodes run one at a time in topological order, declaration
//!   order breaking ties
//! - Contained failures: a failed node never aborts the run; nodes depending
//!   on it are skipped, never retried
//! - Complete history: every executed node appends one [`ExecutionStep`]
//! - Advisory cancellation: once the run is removed from the
//!   [`ExecutionRegistry`], no further node is issued
//!
//! ## NOT Responsible For
//! - Writing artifacts to disk (consumers receive plain data)
//! - Executing or linting generated code

pub mod artifacts;
pub mod graph;
pub mod prompt;
pub mod registry;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::caller::ModelCaller;
use crate::clock::Clock;
use crate::dispatch::Priority;
use crate::metrics;
use crate::provider::GenerationRequest;
use crate::routing::RoutingRequest;

pub use artifacts::{parse_file_blocks, FileBlock, GeneratedArtifact, StepOutput};
pub use graph::{default_graph, execution_order, StepType, WorkflowNode};
pub use prompt::{render_prompt, PromptContext};
pub use registry::{ExecutionInfo, ExecutionKind, ExecutionRegistry};

// ── Default value functions ────────────────────────────────────────────

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.2
}

fn default_report_dir() -> String {
    "docs".to_string()
}

fn default_generated_dir() -> String {
    "generated".to_string()
}

// ── Config ─────────────────────────────────────────────────────────────

/// Defaults for the built-in graph and artifact locations.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WorkflowConfig {
    /// Completion token cap of every default node.
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    /// Sampling temperature of every default node.
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
    /// Directory of markdown reports.
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
    /// Directory of synthetic files for responses without file blocks.
    #[serde(default = "default_generated_dir")]
    pub generated_dir: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: default_max_tokens(),
            default_temperature: default_temperature(),
            report_dir: default_report_dir(),
            generated_dir: default_generated_dir(),
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

/// Errors that prevent a workflow from starting.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorkflowError {
    /// The node graph is malformed.
    #[error("invalid workflow graph: {0}")]
    InvalidGraph(String),

    /// The user prompt is empty.
    #[error("user prompt is empty")]
    EmptyPrompt,
}

// ── Inputs and outputs ─────────────────────────────────────────────────

/// Per-run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPreferences {
    /// Routing context used for every node.
    pub routing: RoutingRequest,
    /// Dispatch priority of every node.
    #[serde(default)]
    pub priority: Priority,
    /// Requirements listed in every prompt's context block.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Constraints listed in every prompt's context block.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Custom graph; `None` runs the default graph.
    #[serde(default)]
    pub nodes: Option<Vec<WorkflowNode>>,
}

impl WorkflowPreferences {
    /// Preferences that route every node with `routing`.
    pub fn new(routing: RoutingRequest) -> Self {
        Self {
            routing,
            priority: Priority::default(),
            requirements: Vec::new(),
            constraints: Vec::new(),
            nodes: None,
        }
    }

    /// Add a requirement.
    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Replace the default graph.
    pub fn with_nodes(mut self, nodes: Vec<WorkflowNode>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// History record of one executed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Node id.
    pub node_id: String,
    /// Step type.
    pub step_type: StepType,
    /// Provider used, or the routing target's provider when routing failed.
    pub provider: String,
    /// Model used; empty when routing failed.
    pub model: String,
    /// Prompt sent.
    pub rendered_prompt: String,
    /// Raw response; empty on failure.
    pub response: String,
    /// Prompt plus completion tokens.
    pub tokens: u64,
    /// Cost in USD.
    pub cost: f64,
    /// Node duration.
    pub duration_ms: u64,
    /// Whether the node succeeded.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
}

/// A node that was not executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedNode {
    /// Node id.
    pub node_id: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Node outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Nodes in the graph.
    pub total_nodes: usize,
    /// Nodes that succeeded.
    pub succeeded: usize,
    /// Nodes that ran and failed.
    pub failed: usize,
    /// Nodes never executed.
    pub skipped: usize,
}

/// Aggregated outcome of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Execution id in the registry.
    pub execution_id: Uuid,
    /// Every artifact, in production order.
    pub artifacts: Vec<GeneratedArtifact>,
    /// Node outcome counts.
    pub summary: WorkflowSummary,
    /// Tokens across successful nodes.
    pub total_tokens: u64,
    /// Cost across successful nodes in USD.
    pub total_cost: f64,
    /// Wall-clock duration of the run.
    pub execution_time_ms: u64,
    /// Distinct `provider/model` pairs that served a successful node.
    pub models_used: BTreeSet<String>,
    /// Executed nodes in order.
    pub steps: Vec<ExecutionStep>,
    /// Nodes not executed.
    pub skipped: Vec<SkippedNode>,
    /// Whether the run was cancelled before finishing.
    pub cancelled: bool,
}

// ── Executor ───────────────────────────────────────────────────────────

/// Runs workflow graphs through a [`ModelCaller`].
#[derive(Debug, Clone)]
pub struct WorkflowExecutor {
    caller: ModelCaller,
    registry: Arc<ExecutionRegistry>,
    clock: Arc<dyn Clock>,
    config: WorkflowConfig,
}

impl WorkflowExecutor {
    /// Create an executor.
    pub fn new(
        caller: ModelCaller,
        registry: Arc<ExecutionRegistry>,
        clock: Arc<dyn Clock>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            caller,
            registry,
            clock,
            config,
        }
    }

    /// Run the default (or a custom) graph for `user_prompt`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError`] only when the run cannot start. Node
    /// failures are reported in the result.
    pub async fn run(
        &self,
        user_prompt: &str,
        preferences: &WorkflowPreferences,
    ) -> Result<WorkflowResult, WorkflowError> {
        let execution_id =
            self.registry
                .register(ExecutionKind::Workflow, user_prompt, self.clock.now());
        let span = tracing::info_span!("workflow.run", execution_id = %execution_id);
        let result = self
            .run_registered(execution_id, user_prompt, preferences)
            .instrument(span)
            .await;
        self.registry.complete(execution_id);
        result
    }

    /// Run under an id the caller already registered.
    ///
    /// # Errors
    ///
    /// See [`WorkflowExecutor::run`].
    pub async fn run_registered(
        &self,
        execution_id: Uuid,
        user_prompt: &str,
        preferences: &WorkflowPreferences,
    ) -> Result<WorkflowResult, WorkflowError> {
        if user_prompt.trim().is_empty() {
            return Err(WorkflowError::EmptyPrompt);
        }

        let default_nodes;
        let nodes: &[WorkflowNode] = match &preferences.nodes {
            Some(custom) => custom,
            None => {
                default_nodes = default_graph(
                    self.config.default_max_tokens,
                    self.config.default_temperature,
                );
                &default_nodes
            }
        };
        let order = execution_order(nodes)?;

        let started = self.clock.now();
        info!(nodes = nodes.len(), "workflow: started");

        let mut context = PromptContext {
            requirements: preferences.requirements.clone(),
            constraints: preferences.constraints.clone(),
            artifact_paths: Vec::new(),
        };
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut prev_response: Option<String> = None;
        let mut artifacts = Vec::new();
        let mut steps = Vec::new();
        let mut skipped = Vec::new();
        let mut models_used = BTreeSet::new();
        let mut total_tokens = 0u64;
        let mut total_cost = 0.0f64;
        let mut cancelled = false;

        for &i in &order {
            let node = &nodes[i];

            if cancelled || !self.registry.is_active(execution_id) {
                if !cancelled {
                    warn!(node_id = %node.id, "workflow: cancelled, issuing no further nodes");
                }
                cancelled = true;
                skipped.push(SkippedNode {
                    node_id: node.id.clone(),
                    reason: "execution cancelled".to_string(),
                });
                metrics::inc_workflow_node(node.step_type.as_str(), "skipped");
                continue;
            }

            let unmet: Vec<&str> = node
                .depends_on
                .iter()
                .filter(|d| !succeeded.contains(d.as_str()))
                .map(String::as_str)
                .collect();
            if !unmet.is_empty() {
                info!(node_id = %node.id, unmet = ?unmet, "workflow: node skipped");
                skipped.push(SkippedNode {
                    node_id: node.id.clone(),
                    reason: format!("unmet dependencies: {}", unmet.join(", ")),
                });
                metrics::inc_workflow_node(node.step_type.as_str(), "skipped");
                continue;
            }

            self.registry.set_current_node(execution_id, &node.id);
            let rendered = render_prompt(
                &node.prompt_template,
                user_prompt,
                prev_response.as_deref(),
                &context,
            );
            let payload = GenerationRequest::new(rendered.clone())
                .with_max_tokens(node.max_tokens)
                .with_temperature(node.temperature);

            let node_started = self.clock.now();
            let outcome = self
                .caller
                .call(&preferences.routing, payload, preferences.priority)
                .await;
            let duration_ms = elapsed_ms(node_started, self.clock.now());

            match outcome {
                Ok(call) => {
                    let provider = call.decision.selected_provider.clone();
                    let model = call.decision.selected_model.clone();
                    let produced = StepOutput::classify(
                        node.step_type,
                        &node.id,
                        &call.response,
                        &self.config.generated_dir,
                    )
                    .into_artifacts(&node.id, &self.config.report_dir);

                    info!(
                        node_id = %node.id,
                        step = %node.step_type,
                        provider = %provider,
                        model = %model,
                        artifacts = produced.len(),
                        duration_ms,
                        "workflow: node succeeded"
                    );
                    metrics::inc_workflow_node(node.step_type.as_str(), "succeeded");

                    context
                        .artifact_paths
                        .extend(produced.iter().map(|a| a.path.clone()));
                    artifacts.extend(produced);
                    total_tokens += call.total_tokens();
                    total_cost += call.cost;
                    models_used.insert(format!("{provider}/{model}"));
                    succeeded.insert(node.id.clone());

                    steps.push(ExecutionStep {
                        node_id: node.id.clone(),
                        step_type: node.step_type,
                        provider,
                        model,
                        rendered_prompt: rendered,
                        tokens: call.total_tokens(),
                        cost: call.cost,
                        response: call.response.clone(),
                        duration_ms,
                        success: true,
                        error: None,
                    });
                    prev_response = Some(call.response);
                }
                Err(e) => {
                    let (provider, model) = e.provider_and_model().unwrap_or_else(|| {
                        (preferences.routing.target.provider().to_string(), String::new())
                    });
                    warn!(
                        node_id = %node.id,
                        step = %node.step_type,
                        provider = %provider,
                        error = %e,
                        "workflow: node failed"
                    );
                    metrics::inc_workflow_node(node.step_type.as_str(), "failed");
                    steps.push(ExecutionStep {
                        node_id: node.id.clone(),
                        step_type: node.step_type,
                        provider,
                        model,
                        rendered_prompt: rendered,
                        response: String::new(),
                        tokens: 0,
                        cost: 0.0,
                        duration_ms,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let summary = WorkflowSummary {
            total_nodes: nodes.len(),
            succeeded: steps.iter().filter(|s| s.success).count(),
            failed: steps.iter().filter(|s| !s.success).count(),
            skipped: skipped.len(),
        };
        let execution_time_ms = elapsed_ms(started, self.clock.now());

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            total_tokens,
            total_cost,
            execution_time_ms,
            cancelled,
            "workflow: finished"
        );

        Ok(WorkflowResult {
            execution_id,
            artifacts,
            summary,
            total_tokens,
            total_cost,
            execution_time_ms,
            models_used,
            steps,
            skipped,
            cancelled,
        })
    }
}

fn elapsed_ms(from: chrono::DateTime<chrono::Utc>, to: chrono::DateTime<chrono::Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}
