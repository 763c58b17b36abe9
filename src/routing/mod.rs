//! # Stage: Routing Engine
//!
//! ## Responsibility
//! Pick exactly one (provider, model) pair for a request from the model
//! catalog, plus an ordered list of up to three same-provider fallbacks.
//!
//! ## Guarantees
//! - Deterministic: the same catalog, spend and request always produce the
//!   same decision
//! - Budget-aware: models over their per-model or the global daily budget
//!   are skipped unless failover allows a degraded pick
//! - Side-effect free: the only shared state read is the budget ledger
//!
//! ## NOT Responsible For
//! - Calling providers (see `dispatch`)
//! - Blocking on spend (see `budget`)

pub mod router;

use thiserror::Error;

pub use router::{RoutingDecision, RoutingEngine, RoutingRequest, RoutingTarget, MAX_FALLBACKS};

/// Errors raised by the routing engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoutingError {
    /// No catalog model is eligible for the request.
    #[error("no model available for provider {provider}: {reason}")]
    NoModelAvailable {
        /// Provider the request targeted.
        provider: String,
        /// Why every candidate was rejected.
        reason: String,
    },
}
