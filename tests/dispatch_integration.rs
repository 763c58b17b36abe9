//! Dispatch layer behaviour through the public API: retries, timeouts,
//! circuit breaking and batch ordering.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{manual_clock, ScriptedProvider, SilentProvider};
use tokio_codegen_orchestrator::dispatch::{CircuitPhase, DispatchConfig};
use tokio_codegen_orchestrator::{
    DispatchError, Dispatcher, GenerationRequest, ModelDescriptor, Priority, ProviderRegistry,
};

fn config() -> DispatchConfig {
    DispatchConfig {
        failure_threshold: 2,
        cooldown_ms: 60_000,
        ..DispatchConfig::default()
    }
}

#[tokio::test]
async fn test_always_failing_provider_errors_after_exactly_three_attempts() {
    let provider = Arc::new(ScriptedProvider::new().fail_on(""));
    let clock = manual_clock();
    let dispatcher = Dispatcher::new(
        DispatchConfig::default(),
        ProviderRegistry::new().with("p", provider.clone()),
        clock.clone(),
    );

    let err = dispatcher
        .dispatch(
            &ModelDescriptor::new("p", "m"),
            GenerationRequest::new("generate"),
            Priority::High,
        )
        .await
        .expect_err("test: always fails");

    assert!(matches!(err, DispatchError::ProviderError { attempts: 3, .. }));
    assert_eq!(provider.call_count(), 3);
    assert_eq!(dispatcher.circuit_breaker_state("p").consecutive_failures, 1);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
}

#[tokio::test]
async fn test_silent_provider_times_out_on_every_attempt() {
    let clock = manual_clock();
    let dispatcher = Dispatcher::new(
        DispatchConfig::default(),
        ProviderRegistry::new().with("p", Arc::new(SilentProvider)),
        clock.clone(),
    );

    let err = dispatcher
        .dispatch(
            &ModelDescriptor::new("p", "m"),
            GenerationRequest::new("hang"),
            Priority::Critical,
        )
        .await
        .expect_err("test: times out");

    assert_eq!(
        err,
        DispatchError::Timeout {
            provider: "p".into(),
            model: "m".into(),
            attempts: 3,
            timeout_ms: 30_000,
        }
    );
    let timeout = Duration::from_secs(30);
    assert_eq!(
        clock.sleeps(),
        vec![timeout, Duration::from_secs(1), timeout, Duration::from_secs(2), timeout]
    );
}

#[tokio::test]
async fn test_breaker_opens_at_threshold_then_recovers_through_one_trial() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.set_failing(true);
    let clock = manual_clock();
    let dispatcher = Dispatcher::new(
        config(),
        ProviderRegistry::new().with("p", provider.clone()),
        clock.clone(),
    );
    let model = ModelDescriptor::new("p", "m");

    for _ in 0..2 {
        let _ = dispatcher
            .dispatch(&model, GenerationRequest::new("x"), Priority::High)
            .await;
    }
    assert_eq!(dispatcher.circuit_breaker_state("p").phase, CircuitPhase::Open);

    let calls_when_opened = provider.call_count();
    let err = dispatcher
        .dispatch(&model, GenerationRequest::new("x"), Priority::High)
        .await
        .expect_err("test: open");
    assert_eq!(err, DispatchError::CircuitOpen { provider: "p".into() });
    assert_eq!(provider.call_count(), calls_when_opened);

    clock.advance(Duration::from_secs(61));
    provider.set_failing(false);

    let out = dispatcher
        .dispatch(&model, GenerationRequest::new("trial"), Priority::High)
        .await
        .expect("test: trial succeeds");
    assert_eq!(out, "ok: trial");

    let state = dispatcher.circuit_breaker_state("p");
    assert_eq!(state.phase, CircuitPhase::Closed);
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn test_failed_trial_reopens_breaker() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.set_failing(true);
    let clock = manual_clock();
    let dispatcher = Dispatcher::new(
        config(),
        ProviderRegistry::new().with("p", provider.clone()),
        clock.clone(),
    );
    let model = ModelDescriptor::new("p", "m");

    for _ in 0..2 {
        let _ = dispatcher
            .dispatch(&model, GenerationRequest::new("x"), Priority::High)
            .await;
    }
    clock.advance(Duration::from_secs(61));

    let err = dispatcher
        .dispatch(&model, GenerationRequest::new("trial"), Priority::High)
        .await
        .expect_err("test: trial fails");
    assert!(matches!(err, DispatchError::ProviderError { .. }));
    assert_eq!(dispatcher.circuit_breaker_state("p").phase, CircuitPhase::Open);

    let err = dispatcher
        .dispatch(&model, GenerationRequest::new("again"), Priority::High)
        .await
        .expect_err("test: reopened");
    assert_eq!(err, DispatchError::CircuitOpen { provider: "p".into() });
}

#[tokio::test]
async fn test_open_breaker_on_one_provider_leaves_others_alone() {
    let bad = Arc::new(ScriptedProvider::new().fail_on(""));
    let good = Arc::new(ScriptedProvider::new());
    let dispatcher = Dispatcher::new(
        config(),
        ProviderRegistry::new()
            .with("bad", bad)
            .with("good", good),
        manual_clock(),
    );

    for _ in 0..2 {
        let _ = dispatcher
            .dispatch(
                &ModelDescriptor::new("bad", "m"),
                GenerationRequest::new("x"),
                Priority::High,
            )
            .await;
    }

    let out = dispatcher
        .dispatch(
            &ModelDescriptor::new("good", "m"),
            GenerationRequest::new("fine"),
            Priority::High,
        )
        .await
        .expect("test: other provider unaffected");
    assert_eq!(out, "ok: fine");
    let states = dispatcher.circuit_breaker_states();
    assert_eq!(states["bad"].phase, CircuitPhase::Open);
    assert_eq!(states["good"].phase, CircuitPhase::Closed);
}

#[tokio::test]
async fn test_queued_batch_runs_by_priority_then_enqueue_order() {
    let provider = Arc::new(ScriptedProvider::new());
    let dispatcher = Dispatcher::new(
        DispatchConfig {
            high_priority_threshold: Priority::Critical,
            ..DispatchConfig::default()
        },
        ProviderRegistry::new().with("p", provider.clone()),
        manual_clock(),
    );
    let model = ModelDescriptor::new("p", "m");

    let submissions = [
        ("low-1", Priority::Low),
        ("high-1", Priority::High),
        ("normal-1", Priority::Normal),
        ("high-2", Priority::High),
        ("low-2", Priority::Low),
    ];

    // Current-thread runtime: every task enqueues before the drain pass runs.
    let handles: Vec<_> = submissions
        .iter()
        .map(|(prompt, priority)| {
            let dispatcher = dispatcher.clone();
            let model = model.clone();
            let prompt = prompt.to_string();
            let priority = *priority;
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&model, GenerationRequest::new(prompt), priority)
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle
            .await
            .expect("test: task joined")
            .expect("test: dispatch ok");
    }

    assert_eq!(
        provider.calls(),
        ["high-1", "high-2", "normal-1", "low-1", "low-2"]
            .map(String::from)
            .to_vec()
    );
    assert_eq!(dispatcher.queue_length(), 0);
}
