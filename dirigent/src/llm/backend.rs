//! Chat backend adapters.
//!
//! A backend is one way to get a completion: a cloud provider behind an
//! OpenAI-compatible endpoint with rotating credentials, or a locally
//! hosted model that must be loaded before it can answer. The failover
//! engine only sees the [`ChatBackend`] trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::llm::credentials::CredentialPool;
use crate::llm::error::BackendError;
use crate::llm::local::LifecycleManager;

/// One completion source, cloud or local.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Stable backend name used in priority lists and logs.
    fn name(&self) -> &str;

    /// Local backends get longer timeouts and serve as the emergency path.
    fn is_local(&self) -> bool;

    async fn chat(
        &self,
        model_id: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, BackendError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Extract the first choice's content from a successful completion body.
fn parse_completion(backend: &str, text: &str) -> Result<String, BackendError> {
    let parsed: ChatCompletionResponse =
        serde_json::from_str(text).map_err(|e| BackendError::Provider {
            backend: backend.to_string(),
            message: format!("malformed completion response: {e}"),
        })?;
    parsed
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| BackendError::Provider {
            backend: backend.to_string(),
            message: "completion response had no choices".to_string(),
        })
}

/// Cloud provider speaking the OpenAI-compatible chat completions protocol,
/// authenticated through a rotating credential pool.
pub struct HttpChatBackend {
    name: String,
    base_url: String,
    credentials: Arc<CredentialPool>,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpChatBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        credentials: Arc<CredentialPool>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Connectivity {
                backend: name.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn chat(
        &self,
        model_id: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, BackendError> {
        let Some(key) = self.credentials.acquire() else {
            return Err(BackendError::NoCredential {
                backend: self.name.clone(),
            });
        };

        let body = ChatCompletionRequest {
            model: model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.credentials.report_failure(&key, &e.to_string());
                if e.is_timeout() {
                    BackendError::Timeout {
                        backend: self.name.clone(),
                        secs: self.timeout_secs,
                    }
                } else {
                    BackendError::Connectivity {
                        backend: self.name.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Connectivity {
                backend: self.name.clone(),
                message: e.to_string(),
            })?;

        if !status.is_success() {
            let message = format!("{status}: {text}");
            self.credentials.report_failure(&key, &message);
            return Err(BackendError::from_provider_message(&self.name, message));
        }

        let content = parse_completion(&self.name, &text)?;
        self.credentials.report_success(&key);
        debug!(backend = %self.name, model = model_id, "completion ok");
        Ok(content)
    }
}

/// Locally hosted model behind an OpenAI-compatible endpoint.
///
/// Loads the model through the lifecycle manager before the request, so a
/// cold model costs one startup wait instead of a connection error.
pub struct LocalChatBackend {
    name: String,
    base_url: String,
    lifecycle: Arc<LifecycleManager>,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl LocalChatBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        lifecycle: Arc<LifecycleManager>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Connectivity {
                backend: name.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            lifecycle,
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

#[async_trait]
impl ChatBackend for LocalChatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn chat(
        &self,
        model_id: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, BackendError> {
        self.lifecycle
            .ensure_running(model_id)
            .await
            .map_err(|e| BackendError::Provider {
                backend: self.name.clone(),
                message: format!("model not available: {e}"),
            })?;

        let body = ChatCompletionRequest {
            model: model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout {
                        backend: self.name.clone(),
                        secs: self.timeout_secs,
                    }
                } else {
                    BackendError::Connectivity {
                        backend: self.name.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Connectivity {
                backend: self.name.clone(),
                message: e.to_string(),
            })?;
        if !status.is_success() {
            return Err(BackendError::from_provider_message(
                &self.name,
                format!("{status}: {text}"),
            ));
        }

        let content = parse_completion(&self.name, &text)?;
        self.lifecycle.touch(model_id).await;
        Ok(content)
    }
}
