//! Workflow runs end to end over scripted providers.

mod common;

use std::sync::Arc;

use common::{manual_clock, ScriptedProvider};
use parking_lot::Mutex;
use tokio_codegen_orchestrator::workflow::{StepType, WorkflowNode};
use tokio_codegen_orchestrator::{
    Catalog, GenerationRequest, ModelDescriptor, Orchestrator, OrchestratorConfig,
    OrchestratorError, ProviderClient, ProviderFailure, ProviderRegistry, RoutingRequest,
    WorkflowError, WorkflowPreferences,
};

const SCAFFOLD_MARKER: &str = "Create the project skeleton";
const BUILD_MARKER: &str = "Implement the project";

const SCAFFOLD_REPLY: &str = "Skeleton follows.\n\n\
    ```toml Cargo.toml\n[package]\nname = \"todo\"\n```\n\n\
    ```rust src/main.rs\nfn main() {}\n```\n";

fn orchestrator(provider: Arc<dyn ProviderClient>) -> Orchestrator {
    Orchestrator::new(
        OrchestratorConfig {
            catalog: Catalog::new(vec![ModelDescriptor::new("p", "coder").with_costs(0.01, 0.02)]),
            ..OrchestratorConfig::default()
        },
        ProviderRegistry::new().with("p", provider),
        manual_clock(),
    )
}

fn preferences() -> WorkflowPreferences {
    WorkflowPreferences::new(RoutingRequest::preferred("p", true))
        .with_requirement("persist todos to a file")
        .with_constraint("no external crates")
}

#[tokio::test]
async fn test_default_workflow_produces_reports_and_files() {
    let provider = Arc::new(ScriptedProvider::new().reply(SCAFFOLD_MARKER, SCAFFOLD_REPLY));
    let orch = orchestrator(provider.clone());

    let result = orch
        .run_workflow("build a CLI todo app", &preferences())
        .await
        .expect("test: workflow runs");

    assert_eq!(result.summary.total_nodes, 6);
    assert_eq!(result.summary.succeeded, 6);
    assert_eq!(result.summary.failed, 0);
    assert_eq!(result.summary.skipped, 0);
    assert!(!result.cancelled);
    assert_eq!(
        result.models_used.iter().cloned().collect::<Vec<_>>(),
        vec!["p/coder".to_string()]
    );

    let paths: Vec<&str> = result.artifacts.iter().map(|a| a.path.as_str()).collect();
    assert!(paths.contains(&"docs/plan.md"));
    assert!(paths.contains(&"Cargo.toml"));
    assert!(paths.contains(&"src/main.rs"));
    assert!(paths.contains(&"generated/build.txt"));
    assert!(paths.contains(&"docs/review.md"));

    let step_ids: Vec<&str> = result.steps.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(
        step_ids,
        vec!["plan", "scaffold", "build", "validate", "quality", "review"]
    );

    let plan_prompt = &result.steps[0].rendered_prompt;
    assert!(plan_prompt.contains("build a CLI todo app"));
    assert!(plan_prompt.contains("### Requirements\n- persist todos to a file"));
    assert!(plan_prompt.contains("### Constraints\n- no external crates"));

    let build_prompt = &result.steps[2].rendered_prompt;
    assert!(build_prompt.contains(SCAFFOLD_REPLY));
    assert!(
        build_prompt.contains("### Generated files\n- docs/plan.md\n- Cargo.toml\n- src/main.rs")
    );

    let tokens: u64 = result.steps.iter().map(|s| s.tokens).sum();
    assert_eq!(result.total_tokens, tokens);
    assert!(result.total_cost > 0.0);
    assert_eq!(provider.call_count(), 6);
    assert!(orch.active_executions().is_empty());
}

#[tokio::test]
async fn test_build_failure_keeps_earlier_artifacts_and_runs_independent_review() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(SCAFFOLD_MARKER, SCAFFOLD_REPLY)
            .fail_on(BUILD_MARKER),
    );
    let orch = orchestrator(provider.clone());

    let result = orch
        .run_workflow("build a CLI todo app", &preferences())
        .await
        .expect("test: workflow runs despite node failure");

    assert_eq!(result.summary.succeeded, 3);
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.summary.skipped, 2);

    let build = result
        .steps
        .iter()
        .find(|s| s.node_id == "build")
        .expect("test: build step recorded");
    assert!(!build.success);
    assert_eq!(build.provider, "p");
    assert_eq!(build.model, "coder");
    assert!(build
        .error
        .as_deref()
        .is_some_and(|e| e.contains("scripted failure")));

    let skipped: Vec<&str> = result.skipped.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(skipped, vec!["validate", "quality"]);
    assert!(result.skipped[0].reason.contains("build"));

    let purposes: Vec<StepType> = result.artifacts.iter().map(|a| a.purpose).collect();
    assert!(purposes.contains(&StepType::Plan));
    assert!(purposes.contains(&StepType::Scaffold));
    assert!(purposes.contains(&StepType::Review));
    assert!(!purposes.contains(&StepType::Build));

    // Review follows the last successful response, which is the scaffold.
    let review = result
        .steps
        .iter()
        .find(|s| s.node_id == "review")
        .expect("test: review ran");
    assert!(review.success);
    assert!(review.rendered_prompt.contains(SCAFFOLD_REPLY));

    // Build was retried three times, never the skipped nodes.
    let build_calls = provider
        .calls()
        .iter()
        .filter(|p| p.contains(BUILD_MARKER))
        .count();
    assert_eq!(build_calls, 3);
    assert_eq!(provider.call_count(), 3 + 3);
}

#[tokio::test]
async fn test_custom_graph_runs_in_dependency_order() {
    let provider = Arc::new(ScriptedProvider::new());
    let orch = orchestrator(provider.clone());
    let nodes = vec![
        WorkflowNode::new("summary", StepType::Review, "sum {{PREV_RESPONSE}}", 256, 0.0)
            .after("draft"),
        WorkflowNode::new("draft", StepType::Plan, "draft {{USER_PROMPT}}", 256, 0.0),
    ];

    let result = orch
        .run_workflow("a parser", &preferences().with_nodes(nodes))
        .await
        .expect("test: custom graph");

    let order: Vec<&str> = result.steps.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(order, vec!["draft", "summary"]);
    assert!(result.steps[1]
        .rendered_prompt
        .starts_with("sum ok: draft a parser"));
}

#[tokio::test]
async fn test_invalid_graph_and_empty_prompt_are_rejected() {
    let orch = orchestrator(Arc::new(ScriptedProvider::new()));
    let cyclic = vec![
        WorkflowNode::new("a", StepType::Plan, "a", 16, 0.0).after("b"),
        WorkflowNode::new("b", StepType::Plan, "b", 16, 0.0).after("a"),
    ];

    let err = orch
        .run_workflow("x", &preferences().with_nodes(cyclic))
        .await
        .expect_err("test: cycle");
    assert!(matches!(
        err,
        OrchestratorError::Workflow(WorkflowError::InvalidGraph(_))
    ));

    let err = orch
        .run_workflow("   ", &preferences())
        .await
        .expect_err("test: empty prompt");
    assert!(matches!(
        err,
        OrchestratorError::Workflow(WorkflowError::EmptyPrompt)
    ));
    assert!(orch.active_executions().is_empty());
}

/// Cancels every active execution from inside its first call.
#[derive(Debug, Default)]
struct CancellingProvider {
    orchestrator: Mutex<Option<Orchestrator>>,
    calls: Mutex<usize>,
}

#[async_trait::async_trait]
impl ProviderClient for CancellingProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
        _model: &ModelDescriptor,
    ) -> Result<String, ProviderFailure> {
        *self.calls.lock() += 1;
        let orch = self.orchestrator.lock().clone();
        if let Some(orch) = orch {
            for execution in orch.active_executions() {
                assert!(orch.cancel_execution(execution.id));
            }
        }
        Ok(format!("done: {}", request.prompt.len()))
    }
}

#[tokio::test]
async fn test_cancellation_stops_further_nodes_but_not_the_inflight_call() {
    let provider = Arc::new(CancellingProvider::default());
    let orch = orchestrator(provider.clone());
    *provider.orchestrator.lock() = Some(orch.clone());

    let result = orch
        .run_workflow("build a CLI todo app", &preferences())
        .await
        .expect("test: workflow returns");

    assert!(result.cancelled);
    assert_eq!(*provider.calls.lock(), 1);
    assert_eq!(result.summary.succeeded, 1);
    assert_eq!(result.summary.skipped, 5);
    assert!(result
        .skipped
        .iter()
        .all(|s| s.reason == "execution cancelled"));
    assert_eq!(result.artifacts.len(), 1);
    assert!(orch.active_executions().is_empty());
}
