//! Provider failover engine and its supporting parts.
//!
//! One entry point, [`FailoverEngine::ask`], hides everything flaky about
//! talking to model providers: response caching for deterministic task
//! classes, priority ordering per task class, per-backend timeouts, an
//! emergency local fallback when a cloud provider rate-limits, and a
//! structured exhaustion error once every option failed.

pub mod backend;
pub mod cache;
pub mod credentials;
pub mod error;
pub mod local;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, ProviderConfig};
use crate::llm::backend::ChatBackend;
use crate::llm::cache::ResponseCache;
use crate::llm::error::BackendError;

/// What kind of work the prompt represents. Drives backend ordering and
/// cache eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    /// Checking an artifact against rules. Deterministic, cacheable.
    Verification,
    /// Judging a candidate output. Deterministic, cacheable.
    Validation,
    /// Small, mechanical text generation. Cacheable.
    SimpleGeneration,
    /// Open-ended generation. Never cached; strongest backend first.
    ComplexGeneration,
}

impl TaskClass {
    /// Responses for these classes are stable enough to reuse.
    pub fn cacheable(self) -> bool {
        matches!(
            self,
            TaskClass::Verification | TaskClass::Validation | TaskClass::SimpleGeneration
        )
    }

    /// Simple generation runs fine on local models, so those move to the
    /// front of the priority order and spare the cloud quota. Every other
    /// class keeps the configured order.
    fn prefers_local(self) -> bool {
        matches!(self, TaskClass::SimpleGeneration)
    }
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub task_class: TaskClass,
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Caller opt-out; caching also requires a cacheable task class.
    pub use_cache: bool,
}

/// A successful completion and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOutcome {
    pub text: String,
    pub backend: String,
    pub cached: bool,
}

/// Every backend in the priority order failed.
#[derive(Debug, Error)]
#[error(
    "all backends exhausted for {task_class:?} (rate_limited={rate_limited}): {last_error}"
)]
pub struct ExhaustedError {
    pub task_class: TaskClass,
    /// At least one failure along the way was a rate limit.
    pub rate_limited: bool,
    pub last_error: String,
}

/// Failover across an ordered set of chat backends.
pub struct FailoverEngine {
    backends: Vec<Arc<dyn ChatBackend>>,
    cache: ResponseCache,
    providers: ProviderConfig,
}

impl FailoverEngine {
    pub fn new(
        backends: Vec<Arc<dyn ChatBackend>>,
        providers: ProviderConfig,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            backends,
            cache: ResponseCache::new(cache.capacity, cache.key_prefix_chars),
            providers,
        }
    }

    /// Run `request` against the backends in priority order until one
    /// succeeds.
    ///
    /// A rate-limited cloud failure triggers one immediate attempt on the
    /// configured local fallback before the normal order resumes.
    pub async fn ask(&self, request: &ChatRequest) -> Result<ChatOutcome, ExhaustedError> {
        let cacheable = request.use_cache && request.task_class.cacheable();
        let cache_key = self
            .cache
            .key(&request.system_prompt, &request.user_prompt);
        if cacheable && let Some(text) = self.cache.get(&cache_key) {
            debug!(task_class = ?request.task_class, "cache hit");
            return Ok(ChatOutcome {
                text,
                backend: "cache".to_string(),
                cached: true,
            });
        }

        let order = self.ordered_backends(request.task_class);
        let mut saw_rate_limit = false;
        let mut fallback_used = false;
        let mut last_error = "no backends configured".to_string();

        let mut queue: Vec<Arc<dyn ChatBackend>> = order;
        let mut idx = 0;
        while idx < queue.len() {
            let backend = Arc::clone(&queue[idx]);
            idx += 1;

            match self.call(&backend, request).await {
                Ok(text) => {
                    if cacheable {
                        self.cache.put(cache_key, text.clone());
                    }
                    return Ok(ChatOutcome {
                        text,
                        backend: backend.name().to_string(),
                        cached: false,
                    });
                }
                Err(err) => {
                    warn!(backend = backend.name(), err = %err, "backend failed");
                    if err.is_rate_limit() {
                        saw_rate_limit = true;
                        if !fallback_used
                            && backend.name() != self.providers.local_fallback
                            && let Some(fallback) = self.emergency_fallback(&queue[idx..])
                        {
                            info!(
                                fallback = fallback.name(),
                                "rate limited, jumping to local fallback"
                            );
                            fallback_used = true;
                            queue.insert(idx, fallback);
                        }
                    }
                    last_error = err.to_string();
                }
            }
        }

        Err(ExhaustedError {
            task_class: request.task_class,
            rate_limited: saw_rate_limit,
            last_error,
        })
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Configured priority order, with local backends pulled forward for
    /// classes that prefer them. Stable within each partition.
    fn ordered_backends(&self, task_class: TaskClass) -> Vec<Arc<dyn ChatBackend>> {
        let mut ordered: Vec<Arc<dyn ChatBackend>> = self
            .providers
            .priority
            .iter()
            .filter_map(|name| {
                self.backends
                    .iter()
                    .find(|b| b.name() == name.as_str())
                    .map(Arc::clone)
            })
            .collect();
        if task_class.prefers_local() {
            ordered.sort_by_key(|b| !b.is_local());
        }
        ordered
    }

    /// The configured local fallback, unless it is already queued ahead.
    fn emergency_fallback(
        &self,
        remaining: &[Arc<dyn ChatBackend>],
    ) -> Option<Arc<dyn ChatBackend>> {
        let name = self.providers.local_fallback.as_str();
        if remaining.iter().any(|b| b.name() == name) {
            return None;
        }
        self.backends
            .iter()
            .find(|b| b.name() == name && b.is_local())
            .map(Arc::clone)
    }

    async fn call(
        &self,
        backend: &Arc<dyn ChatBackend>,
        request: &ChatRequest,
    ) -> Result<String, BackendError> {
        let secs = if backend.is_local() {
            self.providers.local_timeout_secs
        } else {
            self.providers.request_timeout_secs
        };
        match tokio::time::timeout(
            Duration::from_secs(secs),
            backend.chat(&request.model, &request.system_prompt, &request.user_prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                backend: backend.name().to_string(),
                secs,
            }),
        }
    }
}
