//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OrchestratorConfig`] that cannot
//! be expressed through the type system alone (e.g., range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::OrchestratorConfig;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "dispatch.max_retries").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// File watching could not be set up.
    #[error("Watch error on {file}: {reason}")]
    Watch {
        /// Path of the watched file.
        file: String,
        /// Underlying notify error message.
        reason: String,
    },
}

fn invalid(
    errors: &mut Vec<ConfigError>,
    field: impl Into<String>,
    value: impl ToString,
    reason: &str,
) {
    errors.push(ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    });
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// Returns every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Dispatch ─────────────────────────────────────────────────────
    let d = &config.dispatch;
    if d.max_retries == 0 {
        invalid(&mut errors, "dispatch.max_retries", 0, "must be at least 1");
    }
    if d.max_batch_size == 0 {
        invalid(&mut errors, "dispatch.max_batch_size", 0, "must be at least 1");
    }
    if d.call_timeout_ms == 0 {
        invalid(&mut errors, "dispatch.call_timeout_ms", 0, "must be at least 1ms");
    }
    if d.failure_threshold == 0 {
        invalid(&mut errors, "dispatch.failure_threshold", 0, "must be at least 1");
    }
    if d.cooldown_ms == 0 {
        invalid(&mut errors, "dispatch.cooldown_ms", 0, "must be at least 1ms");
    }
    if d.queue_capacity == 0 {
        invalid(&mut errors, "dispatch.queue_capacity", 0, "must be at least 1");
    }

    // ── Budget ───────────────────────────────────────────────────────
    let b = &config.budget;
    for (field, value) in [
        ("budget.daily_limit", b.daily_limit),
        ("budget.weekly_limit", b.weekly_limit),
        ("budget.monthly_limit", b.monthly_limit),
    ] {
        if !value.is_finite() || value < 0.0 {
            invalid(&mut errors, field, value, "must be a non-negative number");
        }
    }
    if !(0.0..=100.0).contains(&b.warning_threshold_percent) {
        invalid(
            &mut errors,
            "budget.warning_threshold_percent",
            b.warning_threshold_percent,
            "must be between 0 and 100",
        );
    }
    if b.retention_days == 0 {
        invalid(&mut errors, "budget.retention_days", 0, "must be at least 1 day");
    }

    // ── Catalog ──────────────────────────────────────────────────────
    let mut seen = HashSet::new();
    for (i, m) in config.catalog.models.iter().enumerate() {
        let prefix = format!("catalog.models[{i}]");
        if m.provider.trim().is_empty() {
            invalid(&mut errors, format!("{prefix}.provider"), "", "must not be empty");
        }
        if m.model_name.trim().is_empty() {
            invalid(&mut errors, format!("{prefix}.model_name"), "", "must not be empty");
        }
        if !seen.insert((m.provider.as_str(), m.model_name.as_str())) {
            invalid(
                &mut errors,
                format!("{prefix}.model_name"),
                &m.model_name,
                "duplicate provider/model pair",
            );
        }
        if m.input_cost_per_1k < 0.0 || m.output_cost_per_1k < 0.0 {
            invalid(
                &mut errors,
                format!("{prefix}.input_cost_per_1k"),
                m.input_cost_per_1k,
                "costs must not be negative",
            );
        }
        if m.max_tokens == 0 {
            invalid(&mut errors, format!("{prefix}.max_tokens"), 0, "must be at least 1");
        }
        if m.max_tokens > m.context_window {
            invalid(
                &mut errors,
                format!("{prefix}.max_tokens"),
                m.max_tokens,
                "must not exceed context_window",
            );
        }
        if let Some(cap) = m.per_model_daily_budget {
            if cap < 0.0 {
                invalid(
                    &mut errors,
                    format!("{prefix}.per_model_daily_budget"),
                    cap,
                    "must not be negative",
                );
            }
        }
    }
    if let Some(cap) = config.catalog.global.daily_budget {
        if cap < 0.0 {
            invalid(&mut errors, "catalog.global.daily_budget", cap, "must not be negative");
        }
    }

    // ── Routing ──────────────────────────────────────────────────────
    if let Some(provider) = &config.routing.default_provider {
        if !config.catalog.models.iter().any(|m| &m.provider == provider) {
            invalid(
                &mut errors,
                "routing.default_provider",
                provider,
                "provider has no models in the catalog",
            );
        }
    }

    // ── Workflow ─────────────────────────────────────────────────────
    let w = &config.workflow;
    if w.default_max_tokens == 0 {
        invalid(&mut errors, "workflow.default_max_tokens", 0, "must be at least 1");
    }
    if !(0.0..=2.0).contains(&w.default_temperature) {
        invalid(
            &mut errors,
            "workflow.default_temperature",
            w.default_temperature,
            "must be between 0.0 and 2.0",
        );
    }
    for (field, dir) in [
        ("workflow.report_dir", &w.report_dir),
        ("workflow.generated_dir", &w.generated_dir),
    ] {
        if dir.trim().is_empty() || dir.starts_with('/') || dir.split('/').any(|c| c == "..") {
            invalid(&mut errors, field, dir, "must be a non-empty relative path");
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, ModelDescriptor};

    fn fields(errors: &[ConfigError]) -> Vec<String> {
        errors
            .iter()
            .filter_map(|e| match e {
                ConfigError::InvalidField { field, .. } => Some(field.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&OrchestratorConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_dispatch_values_are_rejected() {
        let mut c = OrchestratorConfig::default();
        c.dispatch.max_retries = 0;
        c.dispatch.max_batch_size = 0;
        c.dispatch.call_timeout_ms = 0;
        c.dispatch.failure_threshold = 0;
        c.dispatch.cooldown_ms = 0;
        c.dispatch.queue_capacity = 0;
        let errors = validate(&c).expect_err("test: invalid");
        assert_eq!(errors.len(), 6);
    }

    #[test]
    fn test_negative_budget_and_bad_threshold_are_rejected() {
        let mut c = OrchestratorConfig::default();
        c.budget.daily_limit = -1.0;
        c.budget.warning_threshold_percent = 120.0;
        c.budget.retention_days = 0;
        let f = fields(&validate(&c).expect_err("test: invalid"));
        assert!(f.contains(&"budget.daily_limit".to_string()));
        assert!(f.contains(&"budget.warning_threshold_percent".to_string()));
        assert!(f.contains(&"budget.retention_days".to_string()));
    }

    #[test]
    fn test_duplicate_catalog_entries_are_rejected() {
        let mut c = OrchestratorConfig::default();
        c.catalog = Catalog::new(vec![
            ModelDescriptor::new("p", "m"),
            ModelDescriptor::new("p", "m"),
        ]);
        let f = fields(&validate(&c).expect_err("test: duplicate"));
        assert_eq!(f, vec!["catalog.models[1].model_name".to_string()]);
    }

    #[test]
    fn test_max_tokens_above_context_window_is_rejected() {
        let mut c = OrchestratorConfig::default();
        let mut m = ModelDescriptor::new("p", "m");
        m.context_window = 100;
        m.max_tokens = 200;
        c.catalog = Catalog::new(vec![m]);
        assert!(validate(&c).is_err());
    }

    #[test]
    fn test_unknown_default_provider_is_rejected() {
        let mut c = OrchestratorConfig::default();
        c.routing.default_provider = Some("ghost".into());
        let f = fields(&validate(&c).expect_err("test: unknown"));
        assert_eq!(f, vec!["routing.default_provider".to_string()]);
    }

    #[test]
    fn test_workflow_paths_must_be_relative() {
        let mut c = OrchestratorConfig::default();
        c.workflow.report_dir = "/etc".into();
        c.workflow.generated_dir = "../out".into();
        c.workflow.default_temperature = 3.0;
        let errors = validate(&c).expect_err("test: invalid");
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_collects_all_errors_without_short_circuit() {
        let mut c = OrchestratorConfig::default();
        c.dispatch.max_retries = 0;
        c.budget.retention_days = 0;
        c.workflow.default_max_tokens = 0;
        assert_eq!(validate(&c).expect_err("test: invalid").len(), 3);
    }
}
