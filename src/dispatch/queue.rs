//! Pending work queue and batch formation.
//!
//! Units wait here until a drain pass groups them into per-(provider, model)
//! batches. Within a batch units are ordered by descending priority, ties in
//! enqueue order. A unit leaves the queue before its result is delivered.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::circuit_breaker::Admission;
use super::DispatchError;
use crate::catalog::ModelDescriptor;
use crate::metrics;
use crate::provider::GenerationRequest;

/// Request priority levels. Higher is more urgent.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low = 0,
    /// Standard priority for most requests.
    #[default]
    Normal = 1,
    /// Elevated priority.
    High = 2,
    /// Most urgent.
    Critical = 3,
}

impl Priority {
    /// Parse a priority level from a name (`"low"`, `"normal"`, `"high"`,
    /// `"critical"`). Returns `None` for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// Grouping key of a batch.
pub type BatchKey = (String, String);

/// One unit of work waiting for a drain pass.
#[derive(Debug)]
pub struct QueuedUnit {
    /// Unit id, also used as the tracing correlation id.
    pub id: Uuid,
    /// Monotonic enqueue sequence; breaks priority ties.
    pub sequence: u64,
    /// Target model.
    pub model: ModelDescriptor,
    /// Provider payload.
    pub payload: GenerationRequest,
    /// Urgency.
    pub priority: Priority,
    /// When the unit was queued.
    pub enqueued_at: DateTime<Utc>,
    /// How the circuit breaker admitted the unit.
    pub admission: Admission,
    /// Result handle for the submitting caller.
    pub respond_to: oneshot::Sender<Result<String, DispatchError>>,
}

impl QueuedUnit {
    /// Grouping key of this unit.
    pub fn key(&self) -> BatchKey {
        (self.model.provider.clone(), self.model.model_name.clone())
    }
}

/// Take at most `max_batch_size` units per key out of `queue`.
///
/// Keys appear in order of their earliest queued unit. Units not taken stay
/// in `queue` in their original order.
///
/// # Panics
///
/// This function never panics.
pub fn form_batches(queue: &mut Vec<QueuedUnit>, max_batch_size: usize) -> Vec<Vec<QueuedUnit>> {
    let max_batch_size = max_batch_size.max(1);
    let mut groups: Vec<(BatchKey, Vec<QueuedUnit>)> = Vec::new();

    for unit in queue.drain(..) {
        let key = unit.key();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, units)) => units.push(unit),
            None => groups.push((key, vec![unit])),
        }
    }

    let mut batches = Vec::with_capacity(groups.len());
    let mut leftover = Vec::new();
    for (_, mut units) in groups {
        units.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));
        if units.len() > max_batch_size {
            leftover.extend(units.split_off(max_batch_size));
        }
        batches.push(units);
    }

    leftover.sort_by_key(|u| u.sequence);
    *queue = leftover;
    batches
}

/// Bounded queue of pending units.
#[derive(Debug)]
pub struct PendingQueue {
    units: Mutex<Vec<QueuedUnit>>,
    next_sequence: AtomicU64,
    capacity: usize,
}

impl PendingQueue {
    /// Empty queue holding at most `capacity` units.
    pub fn new(capacity: usize) -> Self {
        Self {
            units: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(0),
            capacity,
        }
    }

    /// Next enqueue sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Append `unit`, or hand it back if the queue is full.
    pub fn push(&self, unit: QueuedUnit) -> Result<(), QueuedUnit> {
        let mut units = self.units.lock();
        if units.len() >= self.capacity {
            return Err(unit);
        }
        debug!(
            unit_id = %unit.id,
            provider = %unit.model.provider,
            model = %unit.model.model_name,
            priority = ?unit.priority,
            queue_size = units.len() + 1,
            "dispatch: unit enqueued"
        );
        units.push(unit);
        metrics::set_queue_depth(units.len());
        Ok(())
    }

    /// Remove the next round of batches.
    pub fn take_batches(&self, max_batch_size: usize) -> Vec<Vec<QueuedUnit>> {
        let mut units = self.units.lock();
        let batches = form_batches(&mut units, max_batch_size);
        metrics::set_queue_depth(units.len());
        batches
    }

    /// Units currently waiting.
    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    /// Whether no unit is waiting.
    pub fn is_empty(&self) -> bool {
        self.units.lock().is_empty()
    }
}
