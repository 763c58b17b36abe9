//! Model selection over the catalog.
//!
//! The [`RoutingEngine`] reads a catalog snapshot and the budget governor's
//! spend, then applies the preference or explicit-selection rules.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RoutingError;
use crate::budget::BudgetGovernor;
use crate::catalog::{Catalog, CatalogHandle, ModelDescriptor, FALLBACK_CAPABILITY};

/// Most fallback models attached to a decision.
pub const MAX_FALLBACKS: usize = 3;

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoutingTarget {
    /// Use exactly this model.
    Explicit {
        /// Provider name.
        provider: String,
        /// Model name.
        model: String,
    },
    /// Let the engine choose among a provider's models.
    Preferred {
        /// Provider name.
        provider: String,
        /// Fall back to the provider's first model when every model is
        /// over budget.
        allow_failover: bool,
    },
}

impl RoutingTarget {
    /// Provider the target names.
    pub fn provider(&self) -> &str {
        match self {
            RoutingTarget::Explicit { provider, .. }
            | RoutingTarget::Preferred { provider, .. } => provider,
        }
    }
}

/// Routing input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRequest {
    /// Explicit model or provider preference.
    pub target: RoutingTarget,
    /// Capabilities every candidate must declare. Ignored for explicit
    /// targets.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
}

impl RoutingRequest {
    /// Route to exactly `provider`/`model`.
    pub fn explicit(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            target: RoutingTarget::Explicit {
                provider: provider.into(),
                model: model.into(),
            },
            required_capabilities: BTreeSet::new(),
        }
    }

    /// Let the engine choose among `provider`'s models.
    pub fn preferred(provider: impl Into<String>, allow_failover: bool) -> Self {
        Self {
            target: RoutingTarget::Preferred {
                provider: provider.into(),
                allow_failover,
            },
            required_capabilities: BTreeSet::new(),
        }
    }

    /// Require a capability of every candidate.
    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }
}

/// The engine's choice for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Chosen provider.
    pub selected_provider: String,
    /// Chosen model.
    pub selected_model: String,
    /// Human-readable justification.
    pub reason: String,
    /// Up to [`MAX_FALLBACKS`] alternates of the same provider, in catalog
    /// order.
    pub fallback_models: Vec<String>,
    /// Set when every candidate was over budget and failover picked one
    /// anyway.
    pub degraded: bool,
    /// Descriptor of the chosen model.
    pub descriptor: ModelDescriptor,
}

/// Catalog-driven model selector.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    catalog: CatalogHandle,
    budget: Arc<BudgetGovernor>,
}

impl RoutingEngine {
    /// Create an engine over a catalog and the governor's spend.
    pub fn new(catalog: CatalogHandle, budget: Arc<BudgetGovernor>) -> Self {
        Self { catalog, budget }
    }

    /// Choose a model for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NoModelAvailable`] when the explicit model is
    /// unknown, or when no preferred candidate is eligible and failover is
    /// not allowed.
    pub fn route(&self, request: &RoutingRequest) -> Result<RoutingDecision, RoutingError> {
        let catalog = self.catalog.snapshot();
        let decision = match &request.target {
            RoutingTarget::Explicit { provider, model } => {
                Self::route_explicit(&catalog, provider, model)?
            }
            RoutingTarget::Preferred {
                provider,
                allow_failover,
            } => self.route_preferred(
                &catalog,
                provider,
                *allow_failover,
                &request.required_capabilities,
            )?,
        };

        debug!(
            target: "orchestrator::routing",
            provider = %decision.selected_provider,
            model = %decision.selected_model,
            degraded = decision.degraded,
            fallbacks = decision.fallback_models.len(),
            reason = %decision.reason,
            "routing: model selected"
        );
        Ok(decision)
    }

    fn route_explicit(
        catalog: &Catalog,
        provider: &str,
        model: &str,
    ) -> Result<RoutingDecision, RoutingError> {
        let descriptor = catalog
            .find(provider, model)
            .ok_or_else(|| RoutingError::NoModelAvailable {
                provider: provider.to_string(),
                reason: format!("model {model} is not in the catalog"),
            })?;

        Ok(Self::decision(
            catalog,
            descriptor,
            format!("explicit selection of {provider}/{model}"),
            false,
        ))
    }

    fn route_preferred(
        &self,
        catalog: &Catalog,
        provider: &str,
        allow_failover: bool,
        required: &BTreeSet<String>,
    ) -> Result<RoutingDecision, RoutingError> {
        let capable: Vec<&ModelDescriptor> = catalog
            .models_for(provider)
            .filter(|m| required.iter().all(|c| m.has_capability(c)))
            .collect();

        let mut eligible: Vec<&ModelDescriptor> = capable
            .iter()
            .copied()
            .filter(|m| !self.budget.is_model_over_budget(m, &catalog.global))
            .collect();
        eligible.sort_by_key(|m| m.routing_priority);

        if let Some(best) = eligible.first() {
            let reason = format!(
                "priority-based selection: {} has routing priority {} \
                 ({} of {} candidates within budget)",
                best.model_name,
                best.routing_priority,
                eligible.len(),
                capable.len()
            );
            return Ok(Self::decision(catalog, best, reason, false));
        }

        if allow_failover {
            let first = capable
                .first()
                .copied()
                .or_else(|| catalog.models_for(provider).next());
            if let Some(first) = first {
                let reason = format!(
                    "degraded fallback: every {provider} model is over budget, \
                     using first catalog model {}",
                    first.model_name
                );
                return Ok(Self::decision(catalog, first, reason, true));
            }
        }

        let reason = if catalog.models_for(provider).next().is_none() {
            "provider has no models in the catalog".to_string()
        } else if capable.is_empty() {
            format!("no model declares capabilities {required:?}")
        } else {
            "every candidate is over budget and failover is disabled".to_string()
        };
        Err(RoutingError::NoModelAvailable {
            provider: provider.to_string(),
            reason,
        })
    }

    fn decision(
        catalog: &Catalog,
        chosen: &ModelDescriptor,
        reason: String,
        degraded: bool,
    ) -> RoutingDecision {
        let fallback_models = catalog
            .models_for(&chosen.provider)
            .filter(|m| m.model_name != chosen.model_name && m.has_capability(FALLBACK_CAPABILITY))
            .take(MAX_FALLBACKS)
            .map(|m| m.model_name.clone())
            .collect();

        RoutingDecision {
            selected_provider: chosen.provider.clone(),
            selected_model: chosen.model_name.clone(),
            reason,
            fallback_models,
            degraded,
            descriptor: chosen.clone(),
        }
    }
}
