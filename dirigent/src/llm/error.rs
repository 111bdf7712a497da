//! Backend failure taxonomy.
//!
//! Failover decisions hinge on the kind of failure, not its text, so the
//! adapters classify errors at the edge. Rate-limit detection falls back to
//! substring matching because several providers bury the condition in a 200
//! body or a generic 4xx message.

use thiserror::Error;

/// Message fragments that mark a response as rate-limited regardless of the
/// transport status code.
const RATE_LIMIT_INDICATORS: &[&str] = &[
    "rate limit",
    "too many requests",
    "quota exceeded",
    "429",
    "rate_limit_exceeded",
    "quota_exceeded",
    "usage_limit",
];

#[derive(Debug, Error)]
pub enum BackendError {
    /// The provider refused or garbled the request.
    #[error("backend {backend}: {message}")]
    Provider { backend: String, message: String },

    /// The provider throttled us. The active credential gets a cooldown and
    /// the engine may take the emergency local path.
    #[error("backend {backend} rate limited: {message}")]
    RateLimited { backend: String, message: String },

    /// No usable credential for this backend right now.
    #[error("backend {backend}: no credential available")]
    NoCredential { backend: String },

    /// Transport-level failure before a provider answer arrived.
    #[error("backend {backend} unreachable: {message}")]
    Connectivity { backend: String, message: String },

    /// The call outran its deadline.
    #[error("backend {backend} timed out after {secs}s")]
    Timeout { backend: String, secs: u64 },
}

impl BackendError {
    /// Classify a provider-side failure message, promoting rate-limit text
    /// to [`BackendError::RateLimited`].
    pub fn from_provider_message(backend: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_message(&message) {
            BackendError::RateLimited {
                backend: backend.to_string(),
                message,
            }
        } else {
            BackendError::Provider {
                backend: backend.to_string(),
                message,
            }
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, BackendError::RateLimited { .. })
    }

    pub fn backend(&self) -> &str {
        match self {
            BackendError::Provider { backend, .. }
            | BackendError::RateLimited { backend, .. }
            | BackendError::NoCredential { backend }
            | BackendError::Connectivity { backend, .. }
            | BackendError::Timeout { backend, .. } => backend,
        }
    }
}

/// Case-insensitive scan for the known rate-limit phrasings.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    RATE_LIMIT_INDICATORS
        .iter()
        .any(|indicator| lowered.contains(indicator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_phrasings_are_promoted() {
        for message in [
            "Error 429: slow down",
            "RESOURCE_EXHAUSTED: Quota exceeded for model",
            "Too Many Requests",
            "rate_limit_exceeded",
        ] {
            let err = BackendError::from_provider_message("gemini", message);
            assert!(err.is_rate_limit(), "should be rate limit: {message}");
        }
    }

    #[test]
    fn ordinary_failures_stay_provider_errors() {
        let err = BackendError::from_provider_message("gemini", "invalid request payload");
        assert!(matches!(err, BackendError::Provider { .. }));
        assert_eq!(err.backend(), "gemini");
    }
}
