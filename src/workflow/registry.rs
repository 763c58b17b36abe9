//! Registry of in-progress executions.
//!
//! Removing an entry is how callers cancel: a workflow checks its entry
//! before issuing each node and stops issuing once the entry is gone.
//! Provider calls already in flight are never aborted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// What kind of work an execution is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// A multi-step workflow run.
    Workflow,
    /// A single routed call.
    Dispatch,
}

/// Caller-visible record of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Execution id.
    pub id: Uuid,
    /// Kind of work.
    pub kind: ExecutionKind,
    /// Short description, usually the start of the prompt.
    pub label: String,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// Node currently running, for workflows.
    pub current_node: Option<String>,
}

/// Process-wide map of active executions.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    active: DashMap<Uuid, ExecutionInfo>,
}

impl ExecutionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new execution and return its id.
    pub fn register(&self, kind: ExecutionKind, label: &str, now: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let label: String = label.chars().take(80).collect();
        self.active.insert(
            id,
            ExecutionInfo {
                id,
                kind,
                label,
                started_at: now,
                current_node: None,
            },
        );
        id
    }

    /// Record the node an execution is working on. No-op once cancelled.
    pub fn set_current_node(&self, id: Uuid, node_id: &str) {
        if let Some(mut entry) = self.active.get_mut(&id) {
            entry.current_node = Some(node_id.to_string());
        }
    }

    /// Whether `id` is still registered.
    pub fn is_active(&self, id: Uuid) -> bool {
        self.active.contains_key(&id)
    }

    /// Remove a finished execution.
    pub fn complete(&self, id: Uuid) {
        self.active.remove(&id);
    }

    /// Cancel an execution. Returns `false` if it was not active.
    pub fn cancel(&self, id: Uuid) -> bool {
        let removed = self.active.remove(&id).is_some();
        if removed {
            info!(execution_id = %id, "execution cancelled");
        }
        removed
    }

    /// Snapshot of active executions, oldest first.
    pub fn list(&self) -> Vec<ExecutionInfo> {
        let mut all: Vec<ExecutionInfo> = self.active.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| e.started_at);
        all
    }

    /// Number of active executions.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether nothing is running.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
