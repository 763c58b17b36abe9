//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio_codegen_orchestrator::{
    GenerationRequest, ManualClock, ModelDescriptor, ProviderClient, ProviderFailure,
};

/// Fixed test epoch: a Wednesday at noon UTC.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0)
        .single()
        .expect("test: valid epoch")
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(epoch()))
}

/// Provider whose replies are chosen by substrings of the prompt.
///
/// Every call is recorded. Prompts matching no rule get `ok: <first line>`.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    rules: Mutex<Vec<(String, Result<String, ProviderFailure>)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `text` when the prompt contains `marker`.
    pub fn reply(self, marker: &str, text: &str) -> Self {
        self.rules.lock().push((marker.into(), Ok(text.into())));
        self
    }

    /// Fail with a 500 when the prompt contains `marker`.
    pub fn fail_on(self, marker: &str) -> Self {
        self.rules.lock().push((
            marker.into(),
            Err(ProviderFailure::Api {
                status: 500,
                message: format!("scripted failure on {marker}"),
            }),
        ));
        self
    }

    /// Change every rule and future default to fail (`true`) or succeed.
    pub fn set_failing(&self, failing: bool) {
        let mut rules = self.rules.lock();
        rules.retain(|(marker, _)| !marker.is_empty());
        if failing {
            rules.insert(
                0,
                (
                    String::new(),
                    Err(ProviderFailure::Network("scripted outage".into())),
                ),
            );
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
        _model: &ModelDescriptor,
    ) -> Result<String, ProviderFailure> {
        self.calls.lock().push(request.prompt.clone());
        let rules = self.rules.lock();
        for (marker, reply) in rules.iter() {
            if request.prompt.contains(marker.as_str()) {
                return reply.clone();
            }
        }
        let first = request.prompt.lines().next().unwrap_or_default();
        Ok(format!("ok: {first}"))
    }
}

/// Provider that never answers; every attempt ends in a timeout.
#[derive(Debug, Default)]
pub struct SilentProvider;

#[async_trait]
impl ProviderClient for SilentProvider {
    async fn generate(
        &self,
        _request: &GenerationRequest,
        _model: &ModelDescriptor,
    ) -> Result<String, ProviderFailure> {
        std::future::pending().await
    }
}
