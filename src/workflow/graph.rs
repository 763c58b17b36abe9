//! Workflow nodes, the default code-generation graph, and scheduling order.

use std::collections::{BTreeSet, HashMap, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::WorkflowError;

/// Kind of work a node performs; decides how its output is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Architecture and task breakdown.
    Plan,
    /// Project skeleton files.
    Scaffold,
    /// Implementation files.
    Build,
    /// Correctness review of the build.
    Validate,
    /// Code-quality report.
    Quality,
    /// Final review.
    Review,
}

impl StepType {
    /// Lowercase label used in paths and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Plan => "plan",
            StepType::Scaffold => "scaffold",
            StepType::Build => "build",
            StepType::Validate => "validate",
            StepType::Quality => "quality",
            StepType::Review => "review",
        }
    }

    /// Whether the step's output is parsed for file blocks rather than
    /// stored as a report.
    pub fn produces_files(self) -> bool {
        matches!(self, StepType::Scaffold | StepType::Build)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowNode {
    /// Unique id within the workflow.
    pub id: String,
    /// Kind of step.
    pub step_type: StepType,
    /// Prompt with optional `{{USER_PROMPT}}` and `{{PREV_RESPONSE}}`
    /// placeholders.
    pub prompt_template: String,
    /// Ids of nodes that must succeed first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl WorkflowNode {
    /// Node without dependencies.
    pub fn new(
        id: impl Into<String>,
        step_type: StepType,
        prompt_template: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            id: id.into(),
            step_type,
            prompt_template: prompt_template.into(),
            depends_on: BTreeSet::new(),
            max_tokens,
            temperature,
        }
    }

    /// Add a dependency.
    pub fn after(mut self, node_id: impl Into<String>) -> Self {
        self.depends_on.insert(node_id.into());
        self
    }
}

/// The standard code-generation graph.
///
/// ```text
/// plan ─┬─ scaffold ── build ─┬─ validate
///       │                     └─ quality
///       └─ review
/// ```
///
/// `review` depends on `plan` only, so it still runs when the build fails.
pub fn default_graph(max_tokens: u32, temperature: f32) -> Vec<WorkflowNode> {
    vec![
        WorkflowNode::new(
            "plan",
            StepType::Plan,
            "Produce an implementation plan for the following request. List the \
             components, the files to create, and the order to build them in.\n\n\
             Request:\n{{USER_PROMPT}}",
            max_tokens,
            temperature,
        ),
        WorkflowNode::new(
            "scaffold",
            StepType::Scaffold,
            "Create the project skeleton for this plan: manifests, directory layout \
             and empty module files. Emit every file as a fenced code block whose \
             info string is the language followed by the file path.\n\n\
             Plan:\n{{PREV_RESPONSE}}",
            max_tokens,
            temperature,
        )
        .after("plan"),
        WorkflowNode::new(
            "build",
            StepType::Build,
            "Implement the project on top of this skeleton. Emit every file as a \
             fenced code block whose info string is the language followed by the \
             file path.\n\nSkeleton:\n{{PREV_RESPONSE}}\n\nOriginal request:\n{{USER_PROMPT}}",
            max_tokens,
            temperature,
        )
        .after("scaffold"),
        WorkflowNode::new(
            "validate",
            StepType::Validate,
            "Check this implementation for bugs, missing pieces and mismatches with \
             the request. Report findings as a markdown list.\n\n{{PREV_RESPONSE}}",
            max_tokens,
            temperature,
        )
        .after("build"),
        WorkflowNode::new(
            "quality",
            StepType::Quality,
            "Assess the code quality of the generated project: structure, naming, \
             error handling and test coverage.\n\n{{PREV_RESPONSE}}",
            max_tokens,
            temperature,
        )
        .after("build"),
        WorkflowNode::new(
            "review",
            StepType::Review,
            "Write a final review of the work done for this request, noting risks \
             and follow-ups.\n\nRequest:\n{{USER_PROMPT}}\n\nLatest output:\n{{PREV_RESPONSE}}",
            max_tokens,
            temperature,
        )
        .after("plan"),
    ]
}

/// Check a graph and return its execution order as indices into `nodes`.
///
/// The order is topological; among nodes that are ready at the same time the
/// one declared first runs first.
///
/// # Errors
///
/// Returns [`WorkflowError::InvalidGraph`] for an empty graph, duplicate ids,
/// dependencies on undeclared nodes, or a cycle.
pub fn execution_order(nodes: &[WorkflowNode]) -> Result<Vec<usize>, WorkflowError> {
    if nodes.is_empty() {
        return Err(WorkflowError::InvalidGraph("workflow has no nodes".into()));
    }

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if index.insert(node.id.as_str(), i).is_some() {
            return Err(WorkflowError::InvalidGraph(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
    }

    for node in nodes {
        for dep in &node.depends_on {
            if !index.contains_key(dep.as_str()) {
                return Err(WorkflowError::InvalidGraph(format!(
                    "node '{}' depends on undeclared node '{dep}'",
                    node.id
                )));
            }
            if dep == &node.id {
                return Err(WorkflowError::InvalidGraph(format!(
                    "node '{}' depends on itself",
                    node.id
                )));
            }
        }
    }

    let mut placed: HashSet<usize> = HashSet::with_capacity(nodes.len());
    let mut order = Vec::with_capacity(nodes.len());
    while order.len() < nodes.len() {
        let next = nodes.iter().enumerate().position(|(i, node)| {
            !placed.contains(&i)
                && node
                    .depends_on
                    .iter()
                    .all(|d| index.get(d.as_str()).is_some_and(|j| placed.contains(j)))
        });
        match next {
            Some(i) => {
                placed.insert(i);
                order.push(i);
            }
            None => {
                let stuck: Vec<&str> = nodes
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !placed.contains(i))
                    .map(|(_, n)| n.id.as_str())
                    .collect();
                return Err(WorkflowError::InvalidGraph(format!(
                    "dependency cycle among {stuck:?}"
                )));
            }
        }
    }
    Ok(order)
}
