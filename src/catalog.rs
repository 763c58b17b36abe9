//! # Model Catalog
//!
//! ## Responsibility
//! Hold the static provider → model table with capabilities, token costs and
//! per-model/global limits, and expose lookups to routing and budgeting.
//!
//! ## Guarantees
//! - Immutable: a [`Catalog`] never changes after construction
//! - Reloadable: [`CatalogHandle::reload`] swaps in a whole new table;
//!   callers holding a snapshot keep seeing the old one until they finish
//! - Order-preserving: lookups return models in declaration order
//!
//! ## NOT Responsible For
//! - Tracking usage (that belongs to `budget`)
//! - Choosing a model (that belongs to `routing`)

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Capability a model declares when it may stand in for a sibling model.
pub const FALLBACK_CAPABILITY: &str = "fallback";

fn default_context_window() -> u32 {
    8192
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_routing_priority() -> u32 {
    100
}

fn default_requests_per_minute() -> u32 {
    60
}

/// Static description of one model served by one provider.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ModelDescriptor {
    /// Provider that serves this model (e.g. "openai", "anthropic").
    pub provider: String,
    /// Model identifier sent to the provider.
    pub model_name: String,
    /// Maximum prompt + completion tokens.
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Maximum completion tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// USD per 1 000 input tokens.
    #[serde(default)]
    pub input_cost_per_1k: f64,
    /// USD per 1 000 output tokens.
    #[serde(default)]
    pub output_cost_per_1k: f64,
    /// Free-form capability tags, e.g. `code`, `fallback`.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Lower is preferred.
    #[serde(default = "default_routing_priority")]
    pub routing_priority: u32,
    /// Daily spend cap for this model in USD. `None` means uncapped.
    #[serde(default)]
    pub per_model_daily_budget: Option<f64>,
    /// Advisory request rate for this model.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

impl ModelDescriptor {
    /// Minimal descriptor with default limits and zero cost.
    pub fn new(provider: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
            context_window: default_context_window(),
            max_tokens: default_max_tokens(),
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            capabilities: BTreeSet::new(),
            routing_priority: default_routing_priority(),
            per_model_daily_budget: None,
            requests_per_minute: default_requests_per_minute(),
        }
    }

    /// Set per-1K token costs.
    pub fn with_costs(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.input_cost_per_1k = input_per_1k;
        self.output_cost_per_1k = output_per_1k;
        self
    }

    /// Set the routing priority (lower is preferred).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.routing_priority = priority;
        self
    }

    /// Add a capability tag.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Set the per-model daily budget.
    pub fn with_daily_budget(mut self, usd: f64) -> Self {
        self.per_model_daily_budget = Some(usd);
        self
    }

    /// Whether the model declares `capability`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Estimated USD cost of a call with the given token counts.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_cost_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_cost_per_1k
    }
}

/// Catalog-wide limits loaded alongside the model table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GlobalLimits {
    /// Daily spend cap across all models in USD. `None` means uncapped.
    #[serde(default)]
    pub daily_budget: Option<f64>,
    /// Advisory request rate across all providers.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

/// Immutable model table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Catalog {
    /// Catalog-wide limits.
    #[serde(default)]
    pub global: GlobalLimits,
    /// Models in declaration order.
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

impl Catalog {
    /// Build a catalog from descriptors with no global limits.
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self {
            global: GlobalLimits::default(),
            models,
        }
    }

    /// Set global limits.
    pub fn with_global(mut self, global: GlobalLimits) -> Self {
        self.global = global;
        self
    }

    /// Look up a model by provider and name.
    pub fn find(&self, provider: &str, model_name: &str) -> Option<&ModelDescriptor> {
        self.models
            .iter()
            .find(|m| m.provider == provider && m.model_name == model_name)
    }

    /// All models of a provider, in catalog order.
    pub fn models_for(&self, provider: &str) -> impl Iterator<Item = &ModelDescriptor> + '_ {
        let provider = provider.to_string();
        self.models.iter().filter(move |m| m.provider == provider)
    }

    /// Distinct provider names, in first-seen order.
    pub fn providers(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for m in &self.models {
            if !seen.contains(&m.provider) {
                seen.push(m.provider.clone());
            }
        }
        seen
    }
}

/// Shared, reloadable reference to the current [`Catalog`].
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone)]
pub struct CatalogHandle {
    current: Arc<RwLock<Arc<Catalog>>>,
}

impl CatalogHandle {
    /// Wrap an initial catalog.
    pub fn new(catalog: Catalog) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    /// Snapshot of the current catalog. In-flight work keeps its snapshot
    /// across a reload.
    pub fn snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&self.current.read())
    }

    /// Replace the catalog for subsequent calls.
    pub fn reload(&self, catalog: Catalog) {
        let models = catalog.models.len();
        *self.current.write() = Arc::new(catalog);
        tracing::info!(models, "model catalog reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Catalog {
        Catalog::new(vec![
            ModelDescriptor::new("openai", "gpt-4o").with_costs(0.005, 0.015),
            ModelDescriptor::new("anthropic", "claude-sonnet"),
            ModelDescriptor::new("openai", "gpt-4o-mini").with_capability(FALLBACK_CAPABILITY),
        ])
    }

    #[test]
    fn test_estimate_cost_combines_input_and_output() {
        let m = ModelDescriptor::new("p", "m").with_costs(0.01, 0.03);
        let cost = m.estimate_cost(2000, 1000);
        assert!((cost - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_models_for_preserves_catalog_order() {
        let c = sample();
        let names: Vec<_> = c.models_for("openai").map(|m| m.model_name.as_str()).collect();
        assert_eq!(names, vec!["gpt-4o", "gpt-4o-mini"]);
    }

    #[test]
    fn test_find_requires_matching_provider() {
        let c = sample();
        assert!(c.find("openai", "gpt-4o").is_some());
        assert!(c.find("anthropic", "gpt-4o").is_none());
    }

    #[test]
    fn test_providers_are_distinct_in_first_seen_order() {
        assert_eq!(sample().providers(), vec!["openai", "anthropic"]);
    }

    #[test]
    fn test_reload_does_not_affect_existing_snapshot() {
        let handle = CatalogHandle::new(sample());
        let before = handle.snapshot();
        handle.reload(Catalog::default());
        assert_eq!(before.models.len(), 3);
        assert!(handle.snapshot().models.is_empty());
    }

    #[test]
    fn test_descriptor_defaults_from_toml() {
        let m: ModelDescriptor = toml::from_str(
            r#"
provider = "openai"
model_name = "gpt-4o"
"#,
        )
        .expect("test: parse");
        assert_eq!(m.routing_priority, 100);
        assert_eq!(m.max_tokens, 4096);
        assert!(m.per_model_daily_budget.is_none());
    }
}
