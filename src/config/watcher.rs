//! Configuration hot-reload watcher.
//!
//! ## Responsibility
//! Watch the orchestrator TOML file for changes and broadcast validated new
//! configs to subscribers. Invalid reloads are logged and rejected; the
//! current config remains unchanged.
//!
//! ## Guarantees
//! - Only validated configs are broadcast
//! - Invalid file edits are logged but do not disrupt the running system
//! - File watching is debounced to avoid rapid re-reads on multi-write editors
//! - Subscribers receive the new config via a `broadcast` channel
//!
//! ## NOT Responsible For
//! - Applying the config (the orchestrator swaps the catalog via
//!   `Orchestrator::reload_catalog`)
//! - Initial config loading (that belongs to `loader`)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, Mutex};

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::OrchestratorConfig;

/// Minimum spacing between two reloads.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// How often queued file events are drained.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Watches a config file and broadcasts validated [`OrchestratorConfig`]s.
///
/// Dropping the watcher stops file watching and ends the background task.
///
/// # Panics
///
/// This type never panics.
pub struct ConfigWatcher {
    tx: broadcast::Sender<OrchestratorConfig>,
    _watcher: Arc<Mutex<RecommendedWatcher>>,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl ConfigWatcher {
    /// Start watching `path`.
    ///
    /// The initial config is **not** broadcast; use
    /// [`load_from_file`] for the initial load.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Watch` if the file watcher cannot be created or
    /// the parent directory cannot be watched.
    ///
    /// # Panics
    ///
    /// This function never panics.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use tokio_codegen_orchestrator::config::watcher::ConfigWatcher;
    /// use std::path::PathBuf;
    ///
    /// let (watcher, mut rx) = ConfigWatcher::new(PathBuf::from("orchestrator.toml"))?;
    /// tokio::spawn(async move {
    ///     while let Ok(config) = rx.recv().await {
    ///         orchestrator.reload_catalog(config.catalog);
    ///     }
    /// });
    /// ```
    pub fn new(
        path: PathBuf,
    ) -> Result<(Self, broadcast::Receiver<OrchestratorConfig>), ConfigError> {
        let (tx, rx) = broadcast::channel(8);
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| ConfigError::Watch {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // Watch the directory so atomic saves (write temp, rename over) are seen.
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Watch {
                file: watch_dir.display().to_string(),
                reason: e.to_string(),
            })?;

        let task_tx = tx.clone();
        tokio::spawn(async move {
            let mut last_reload: Option<std::time::Instant> = None;

            loop {
                tokio::time::sleep(POLL_INTERVAL).await;

                let mut should_reload = false;
                loop {
                    match notify_rx.try_recv() {
                        Ok(event) => {
                            let relevant = matches!(
                                event.kind,
                                EventKind::Modify(_) | EventKind::Create(_)
                            ) && event.paths.iter().any(|p| p.file_name() == path.file_name());
                            should_reload |= relevant;
                        }
                        Err(std::sync::mpsc::TryRecvError::Empty) => break,
                        // The notify watcher was dropped along with ConfigWatcher.
                        Err(std::sync::mpsc::TryRecvError::Disconnected) => return,
                    }
                }

                let debounced = last_reload.is_some_and(|t| t.elapsed() < DEBOUNCE);
                if !should_reload || debounced {
                    continue;
                }
                last_reload = Some(std::time::Instant::now());

                match load_from_file(&path) {
                    Ok(new_config) => {
                        tracing::info!(
                            target: "orchestrator::config",
                            path = %path.display(),
                            models = new_config.catalog.models.len(),
                            "config reloaded successfully"
                        );
                        let _ = task_tx.send(new_config);
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "orchestrator::config",
                            path = %path.display(),
                            error = %e,
                            "config reload rejected, keeping current config"
                        );
                    }
                }
            }
        });

        Ok((
            Self {
                tx,
                _watcher: Arc::new(Mutex::new(watcher)),
            },
            rx,
        ))
    }

    /// Subscribe to config change notifications.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorConfig> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[[catalog.models]]
provider = "local"
model_name = "first"
capabilities = ["fallback"]
"#;

    #[tokio::test]
    async fn test_config_watcher_subscribe_returns_receiver() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (watcher, _rx) = ConfigWatcher::new(path).expect("test: create watcher");
        let _rx2 = watcher.subscribe();
        assert_eq!(watcher.tx.receiver_count(), 2);
    }

    #[tokio::test]
    async fn test_config_watcher_detects_file_change() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let updated = VALID_TOML.replace("first", "second");
        let mut f = std::fs::File::create(&path).expect("test: open for write");
        f.write_all(updated.as_bytes()).expect("test: write");
        f.sync_all().expect("test: sync");
        drop(f);

        let config = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("test: update within 3s")
            .expect("test: recv");
        assert_eq!(config.catalog.models[0].model_name, "second");
    }

    #[tokio::test]
    async fn test_config_watcher_rejects_invalid_reload() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&path, "[dispatch]\nmax_retries = 0\n").expect("test: write invalid");

        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(result.is_err(), "should not broadcast invalid config");
    }

    #[tokio::test]
    async fn test_config_watcher_nonexistent_parent_returns_error() {
        let path = PathBuf::from("/definitely/nonexistent/dir/orchestrator.toml");
        let result = ConfigWatcher::new(path);
        assert!(matches!(result, Err(ConfigError::Watch { .. })));
    }
}
