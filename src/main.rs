//! Demo binary for tokio-codegen-orchestrator
//!
//! Runs the default code-generation workflow for one prompt against offline
//! echo providers and prints the result as JSON. When a config file is given,
//! edits to its catalog are picked up while the workflow runs.
//!
//! ```text
//! codegen-orchestrator [CONFIG.toml] "build a CLI todo app"
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (overrides `[observability]`)
//! - `RUST_LOG=info`: log level filter

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_codegen_orchestrator::config::loader::load_from_file;
use tokio_codegen_orchestrator::config::watcher::ConfigWatcher;
use tokio_codegen_orchestrator::{
    init_tracing, init_tracing_with_format, metrics, Catalog, EchoProvider, ModelDescriptor,
    Orchestrator, OrchestratorConfig, ProviderRegistry, WorkflowPreferences,
};
use tracing::{info, warn};

const USAGE: &str = "usage: codegen-orchestrator [CONFIG.toml] <PROMPT>";

/// Two local echo models so the demo runs with no config file.
fn demo_catalog() -> Catalog {
    Catalog::new(vec![
        ModelDescriptor::new("local", "echo-small")
            .with_costs(0.0001, 0.0002)
            .with_priority(1)
            .with_capability("code"),
        ModelDescriptor::new("local", "echo-large")
            .with_costs(0.001, 0.002)
            .with_priority(2)
            .with_capability("code")
            .with_capability("fallback"),
    ])
}

/// Swap the orchestrator's catalog whenever the config file changes.
///
/// The returned watcher must be kept alive for reloads to keep arriving.
fn watch_catalog(
    orchestrator: &Orchestrator,
    path: &str,
) -> Result<ConfigWatcher, Box<dyn std::error::Error>> {
    let (watcher, mut rx) = ConfigWatcher::new(PathBuf::from(path))?;
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        while let Ok(config) = rx.recv().await {
            if config.catalog.models.is_empty() {
                warn!("reloaded catalog is empty, keeping the current one");
                continue;
            }
            info!(models = config.catalog.models.len(), "catalog reloaded");
            orchestrator.reload_catalog(config.catalog);
        }
    });
    Ok(watcher)
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, prompt) = match args.as_slice() {
        [prompt] => (None, prompt.clone()),
        [path, prompt] => (Some(path.clone()), prompt.clone()),
        _ => {
            eprintln!("{USAGE}");
            return Ok(ExitCode::from(2));
        }
    };

    let mut config = match &config_path {
        Some(path) => load_from_file(Path::new(path))?,
        None => OrchestratorConfig::default(),
    };

    // LOG_FORMAT wins over the config file.
    let _ = if std::env::var("LOG_FORMAT").is_ok() {
        init_tracing()
    } else {
        init_tracing_with_format(config.observability.log_format)
    };

    if config.observability.metrics_enabled {
        metrics::init_metrics()?;
    }

    if config.catalog.models.is_empty() {
        warn!("catalog is empty, using the built-in demo catalog");
        config.catalog = demo_catalog();
    }

    let mut providers = ProviderRegistry::new();
    for provider in config.catalog.providers() {
        providers.register(
            provider,
            Arc::new(EchoProvider::with_delay(Duration::from_millis(10))),
        );
    }

    let orchestrator = Orchestrator::from_config(config, providers);
    let _watcher = match &config_path {
        Some(path) => Some(watch_catalog(&orchestrator, path)?),
        None => None,
    };
    let preferences = WorkflowPreferences::new(orchestrator.default_routing()?);

    info!(prompt = %prompt, "starting workflow");
    let result = orchestrator.run_workflow(&prompt, &preferences).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if orchestrator.config().observability.metrics_enabled {
        eprintln!("{}", metrics::gather_metrics());
    }

    if result.summary.failed > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
