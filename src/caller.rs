//! Route → budget pre-check → dispatch → record.
//!
//! [`ModelCaller`] is the one sequence both the single-call path and every
//! workflow node go through. Token counts are estimated from text length
//! (about four characters per token); providers are not asked for usage.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::budget::{BudgetAlert, BudgetError, BudgetGovernor};
use crate::dispatch::{Dispatcher, Priority};
use crate::provider::GenerationRequest;
use crate::routing::{RoutingDecision, RoutingEngine, RoutingRequest};
use crate::OrchestratorError;

/// Approximate token count of `text`: one token per four characters,
/// rounded up.
///
/// # Panics
///
/// This function never panics.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Result of one successful routed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    /// Raw provider response.
    pub response: String,
    /// Routing decision the call used.
    pub decision: RoutingDecision,
    /// Pre-flight token estimate (prompt plus completion cap).
    pub estimated_tokens: u64,
    /// Pre-flight cost estimate in USD.
    pub estimated_cost: f64,
    /// Prompt tokens recorded.
    pub input_tokens: u64,
    /// Completion tokens recorded.
    pub output_tokens: u64,
    /// Cost recorded in USD.
    pub cost: f64,
    /// Alerts raised by the pre-check and by recording.
    pub budget_alerts: Vec<BudgetAlert>,
}

impl CallOutcome {
    /// Prompt plus completion tokens.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Shared call sequence over the routing engine, dispatcher and governor.
#[derive(Debug, Clone)]
pub struct ModelCaller {
    router: RoutingEngine,
    dispatcher: Dispatcher,
    budget: Arc<BudgetGovernor>,
}

impl ModelCaller {
    /// Wire the three components together.
    pub fn new(router: RoutingEngine, dispatcher: Dispatcher, budget: Arc<BudgetGovernor>) -> Self {
        Self {
            router,
            dispatcher,
            budget,
        }
    }

    /// Route `payload`, check the budget, dispatch, and record usage.
    ///
    /// Usage is recorded only for successful calls.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::Routing`] when no model is eligible
    /// - [`OrchestratorError::Budget`] when hard-limit mode vetoes the call;
    ///   no provider is contacted
    /// - [`OrchestratorError::Dispatch`] when the dispatch layer fails
    pub async fn call(
        &self,
        routing: &RoutingRequest,
        payload: GenerationRequest,
        priority: Priority,
    ) -> Result<CallOutcome, OrchestratorError> {
        let decision = self.router.route(routing)?;
        let model = &decision.descriptor;

        let input_tokens = estimate_tokens(&payload.prompt);
        let output_cap = u64::from(payload.max_tokens.min(model.max_tokens));
        let estimated_tokens = input_tokens + output_cap;
        let estimated_cost = model.estimate_cost(input_tokens, output_cap);

        let check = self.budget.check_budget(
            &model.provider,
            &model.model_name,
            estimated_tokens,
            estimated_cost,
        );
        if !check.allowed {
            return Err(BudgetError::BudgetExceeded {
                provider: model.provider.clone(),
                model: model.model_name.clone(),
                periods: check.exceeded_periods,
            }
            .into());
        }

        let response = match self.dispatcher.dispatch(model, payload, priority).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    provider = %model.provider,
                    model = %model.model_name,
                    fallbacks = ?decision.fallback_models,
                    error = %e,
                    "call failed"
                );
                return Err(e.into());
            }
        };

        let output_tokens = estimate_tokens(&response);
        let cost = model.estimate_cost(input_tokens, output_tokens);
        let mut budget_alerts = check.alerts;
        budget_alerts.extend(self.budget.record_usage(
            &model.provider,
            &model.model_name,
            input_tokens,
            output_tokens,
            cost,
        ));

        debug!(
            provider = %model.provider,
            model = %model.model_name,
            input_tokens,
            output_tokens,
            cost,
            "call completed"
        );

        Ok(CallOutcome {
            response,
            decision,
            estimated_tokens,
            estimated_cost,
            input_tokens,
            output_tokens,
            cost,
            budget_alerts,
        })
    }

    /// The dispatcher this caller drives.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The routing engine this caller drives.
    pub fn router(&self) -> &RoutingEngine {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_estimate_tokens_counts_chars_not_bytes() {
        assert_eq!(estimate_tokens("ééééé"), 2);
    }
}
