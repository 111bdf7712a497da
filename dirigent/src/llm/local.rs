//! Lifecycle management for locally hosted model backends.
//!
//! Local models are heavyweight: the manager caps how many run at once,
//! evicts the least recently used one to make room, waits for a started
//! model to become visible in the runtime, and sweeps idle models in the
//! background. The [`ModelRuntime`] trait isolates the actual container
//! runtime so tests drive the manager with an in-memory fake.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::LocalModelConfig;

/// Container runtime operations the manager needs.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Names of models currently loaded in the runtime.
    async fn running_models(&self) -> Result<Vec<String>>;

    /// Ask the runtime to load `backend`. Readiness is polled separately.
    async fn start(&self, backend: &str) -> Result<()>;

    /// Unload `backend`.
    async fn stop(&self, backend: &str) -> Result<()>;
}

/// Runtime backed by the `docker model` CLI.
#[derive(Debug, Default)]
pub struct DockerModelRuntime;

impl DockerModelRuntime {
    pub fn new() -> Self {
        Self
    }

    async fn docker(args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .arg("model")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("run docker model {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "docker model {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ModelRuntime for DockerModelRuntime {
    async fn running_models(&self) -> Result<Vec<String>> {
        let stdout = Self::docker(&["ps"]).await?;
        // First line is the column header; the model name is the first field.
        Ok(stdout
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    async fn start(&self, backend: &str) -> Result<()> {
        // An empty one-shot prompt loads the model and returns.
        Self::docker(&["run", backend, ""]).await?;
        Ok(())
    }

    async fn stop(&self, backend: &str) -> Result<()> {
        Self::docker(&["unload", backend]).await?;
        Ok(())
    }
}

/// Point-in-time view for the status API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LocalModelStats {
    pub running: Vec<String>,
    pub max_concurrent: usize,
}

/// LRU lifecycle manager over a [`ModelRuntime`].
pub struct LifecycleManager {
    runtime: Arc<dyn ModelRuntime>,
    config: LocalModelConfig,
    /// Managed model name -> last use. Guards ensure/evict as one critical
    /// section so two callers cannot both start models past the ceiling.
    last_used: Mutex<HashMap<String, Instant>>,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ModelRuntime>, config: LocalModelConfig) -> Self {
        Self {
            runtime,
            config,
            last_used: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure `backend` is loaded, evicting the least recently used
    /// managed model if the ceiling is reached, then wait for the runtime
    /// to report it running.
    pub async fn ensure_running(&self, backend: &str) -> Result<()> {
        let mut last_used = self.last_used.lock().await;
        let running = self.runtime.running_models().await?;

        if running.iter().any(|m| m.as_str() == backend) {
            last_used.insert(backend.to_string(), Instant::now());
            return Ok(());
        }

        while last_used.len() >= self.config.max_concurrent {
            let Some(victim) = last_used
                .iter()
                .min_by_key(|(_, used)| **used)
                .map(|(name, _)| name.clone())
            else {
                break;
            };
            info!(model = %victim, "evicting least recently used model");
            self.runtime.stop(&victim).await?;
            last_used.remove(&victim);
        }

        info!(model = backend, "starting local model");
        self.runtime.start(backend).await?;

        for attempt in 1..=self.config.start_poll_attempts {
            let running = self.runtime.running_models().await?;
            if running.iter().any(|m| m.as_str() == backend) {
                last_used.insert(backend.to_string(), Instant::now());
                debug!(model = backend, attempt, "model ready");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(self.config.start_poll_interval_secs)).await;
        }
        bail!(
            "model {backend} did not become ready after {} polls",
            self.config.start_poll_attempts
        )
    }

    /// Refresh a model's last-use stamp after serving a request.
    pub async fn touch(&self, backend: &str) {
        let mut last_used = self.last_used.lock().await;
        if let Some(used) = last_used.get_mut(backend) {
            *used = Instant::now();
        }
    }

    /// Unload managed models that have sat idle past the timeout.
    pub async fn sweep_idle(&self) -> Result<()> {
        let idle_after = Duration::from_secs(self.config.idle_timeout_secs);
        let mut last_used = self.last_used.lock().await;
        let now = Instant::now();
        let idle: Vec<String> = last_used
            .iter()
            .filter(|(_, used)| now.duration_since(**used) >= idle_after)
            .map(|(name, _)| name.clone())
            .collect();
        for model in idle {
            info!(model = %model, "unloading idle model");
            if let Err(e) = self.runtime.stop(&model).await {
                warn!(model = %model, err = %e, "failed to unload idle model");
            }
            last_used.remove(&model);
        }
        Ok(())
    }

    /// Run the idle sweep on its configured interval until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(manager.config.sweep_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = manager.sweep_idle().await {
                    warn!(err = %e, "idle sweep failed");
                }
            }
        })
    }

    /// Unload every managed model, for shutdown or an explicit cleanup call.
    pub async fn force_stop_all(&self) -> Result<()> {
        let mut last_used = self.last_used.lock().await;
        for model in last_used.keys().cloned().collect::<Vec<_>>() {
            if let Err(e) = self.runtime.stop(&model).await {
                warn!(model = %model, err = %e, "failed to stop model");
            }
        }
        last_used.clear();
        Ok(())
    }

    pub async fn stats(&self) -> Result<LocalModelStats> {
        let mut running = self.runtime.running_models().await?;
        running.sort();
        Ok(LocalModelStats {
            running,
            max_concurrent: self.config.max_concurrent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRuntime;

    fn fast_config() -> LocalModelConfig {
        LocalModelConfig {
            max_concurrent: 2,
            idle_timeout_secs: 0,
            start_poll_attempts: 2,
            start_poll_interval_secs: 0,
            sweep_interval_secs: 1,
        }
    }

    #[tokio::test]
    async fn ensure_starts_a_missing_model() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = LifecycleManager::new(runtime.clone(), fast_config());

        manager.ensure_running("llama").await.expect("ensure");
        assert_eq!(*runtime.started.lock().expect("started"), vec!["llama"]);

        // Already running, no second start.
        manager.ensure_running("llama").await.expect("ensure again");
        assert_eq!(runtime.started.lock().expect("started").len(), 1);
    }

    #[tokio::test]
    async fn ceiling_evicts_the_least_recently_used() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = LifecycleManager::new(runtime.clone(), fast_config());

        manager.ensure_running("a").await.expect("a");
        manager.ensure_running("b").await.expect("b");
        // Using "a" again makes "b" the eviction victim.
        manager.ensure_running("a").await.expect("touch a");
        manager.ensure_running("c").await.expect("c");

        assert_eq!(*runtime.stopped.lock().expect("stopped"), vec!["b"]);
        let stats = manager.stats().await.expect("stats");
        assert_eq!(stats.running, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn start_polling_is_bounded() {
        let runtime = Arc::new(FakeRuntime::failing());
        let manager = LifecycleManager::new(runtime, fast_config());

        let err = manager.ensure_running("llama").await.unwrap_err();
        assert!(err.to_string().contains("did not become ready"));
    }

    #[tokio::test]
    async fn idle_sweep_unloads_stale_models() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = LifecycleManager::new(runtime.clone(), fast_config());

        manager.ensure_running("llama").await.expect("ensure");
        // idle_timeout_secs = 0: everything is immediately stale.
        manager.sweep_idle().await.expect("sweep");
        assert_eq!(*runtime.stopped.lock().expect("stopped"), vec!["llama"]);
    }

    #[tokio::test]
    async fn force_stop_all_clears_the_manager() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = LifecycleManager::new(runtime.clone(), fast_config());

        manager.ensure_running("a").await.expect("a");
        manager.ensure_running("b").await.expect("b");
        manager.force_stop_all().await.expect("stop all");

        let mut stopped = runtime.stopped.lock().expect("stopped").clone();
        stopped.sort();
        assert_eq!(stopped, vec!["a", "b"]);
    }
}
