//! Rotating credential pool for cloud providers.
//!
//! Keys advance round-robin; a key that trips a rate limit is benched for a
//! cooldown window. When every key is benched the pool hands out the one
//! whose cooldown expires soonest rather than failing outright, since the
//! provider-side window may already have passed.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::llm::error::is_rate_limit_message;

#[derive(Debug)]
struct Credential {
    key: String,
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
    uses: u64,
    successes: u64,
}

impl Credential {
    fn available(&self, now: Instant) -> bool {
        self.cooldown_until.is_none_or(|until| until <= now)
    }
}

/// Per-credential counters. The key itself is never exposed, only its
/// position in the pool.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CredentialStats {
    pub index: usize,
    pub uses: u64,
    pub successes: u64,
    pub consecutive_failures: u32,
    pub cooling_down: bool,
}

/// Point-in-time view of the pool, for the status API.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub cooling_down: usize,
    /// Successful calls / total calls across all credentials, 1.0 when idle.
    pub success_rate: f64,
    pub credentials: Vec<CredentialStats>,
}

#[derive(Debug, Default)]
struct PoolState {
    credentials: Vec<Credential>,
    cursor: usize,
}

/// Round-robin pool with per-key rate-limit cooldowns.
#[derive(Debug)]
pub struct CredentialPool {
    cooldown: Duration,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>, cooldown: Duration) -> Self {
        let credentials = keys
            .into_iter()
            .map(|key| Credential {
                key,
                cooldown_until: None,
                consecutive_failures: 0,
                uses: 0,
                successes: 0,
            })
            .collect();
        Self {
            cooldown,
            state: Mutex::new(PoolState {
                credentials,
                cursor: 0,
            }),
        }
    }

    /// Pick the next key.
    ///
    /// Returns `None` only for an empty pool. A single-key pool always
    /// returns that key, cooldown or not, since rotation has nothing to
    /// rotate to.
    pub fn acquire(&self) -> Option<String> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("credential pool lock");
        let len = state.credentials.len();
        if len == 0 {
            return None;
        }
        if len == 1 {
            let cred = &mut state.credentials[0];
            cred.uses += 1;
            return Some(cred.key.clone());
        }

        for offset in 0..len {
            let idx = (state.cursor + offset) % len;
            if state.credentials[idx].available(now) {
                state.cursor = (idx + 1) % len;
                let cred = &mut state.credentials[idx];
                cred.uses += 1;
                return Some(cred.key.clone());
            }
        }

        // Everything is cooling down; least-benched key wins.
        let idx = state
            .credentials
            .iter()
            .enumerate()
            .min_by_key(|(_, cred)| cred.cooldown_until)
            .map(|(idx, _)| idx)?;
        warn!("all credentials cooling down, reusing the soonest to recover");
        state.cursor = (idx + 1) % len;
        let cred = &mut state.credentials[idx];
        cred.uses += 1;
        Some(cred.key.clone())
    }

    /// Clear failure bookkeeping after a successful call with `key`.
    pub fn report_success(&self, key: &str) {
        let mut state = self.state.lock().expect("credential pool lock");
        if let Some(cred) = state.credentials.iter_mut().find(|c| c.key == key) {
            cred.consecutive_failures = 0;
            cred.cooldown_until = None;
            cred.successes += 1;
        }
    }

    /// Record a failed call with `key`. Rate-limit failures bench the key
    /// for the configured cooldown.
    pub fn report_failure(&self, key: &str, message: &str) {
        let rate_limited = is_rate_limit_message(message);
        let mut state = self.state.lock().expect("credential pool lock");
        let Some(cred) = state.credentials.iter_mut().find(|c| c.key == key) else {
            return;
        };
        cred.consecutive_failures += 1;
        if rate_limited {
            cred.cooldown_until = Some(Instant::now() + self.cooldown);
            info!(
                failures = cred.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "credential rate limited, benched"
            );
        } else {
            debug!(failures = cred.consecutive_failures, "credential failure");
        }
    }

    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let state = self.state.lock().expect("credential pool lock");
        let available = state
            .credentials
            .iter()
            .filter(|c| c.available(now))
            .count();
        let total_uses: u64 = state.credentials.iter().map(|c| c.uses).sum();
        let total_successes: u64 = state.credentials.iter().map(|c| c.successes).sum();
        let success_rate = if total_uses == 0 {
            1.0
        } else {
            total_successes as f64 / total_uses as f64
        };
        PoolStats {
            total: state.credentials.len(),
            available,
            cooling_down: state.credentials.len() - available,
            success_rate,
            credentials: state
                .credentials
                .iter()
                .enumerate()
                .map(|(index, c)| CredentialStats {
                    index,
                    uses: c.uses,
                    successes: c.successes,
                    consecutive_failures: c.consecutive_failures,
                    cooling_down: !c.available(now),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state
            .lock()
            .expect("credential pool lock")
            .credentials
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_is_round_robin() {
        let pool = CredentialPool::new(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            Duration::from_secs(300),
        );
        assert_eq!(pool.acquire().as_deref(), Some("a"));
        assert_eq!(pool.acquire().as_deref(), Some("b"));
        assert_eq!(pool.acquire().as_deref(), Some("c"));
        assert_eq!(pool.acquire().as_deref(), Some("a"));
    }

    #[test]
    fn rate_limited_key_is_skipped_until_cooldown_expires() {
        let pool = CredentialPool::new(
            vec!["a".to_string(), "b".to_string()],
            Duration::from_secs(300),
        );
        assert_eq!(pool.acquire().as_deref(), Some("a"));
        pool.report_failure("a", "429 too many requests");

        assert_eq!(pool.acquire().as_deref(), Some("b"));
        assert_eq!(pool.acquire().as_deref(), Some("b"));
        assert_eq!(pool.stats().cooling_down, 1);
    }

    #[test]
    fn exhausted_pool_falls_back_to_soonest_recovery() {
        let pool = CredentialPool::new(
            vec!["a".to_string(), "b".to_string()],
            Duration::from_secs(300),
        );
        pool.report_failure("a", "quota exceeded");
        pool.report_failure("b", "quota exceeded");

        assert_eq!(pool.stats().available, 0);
        // Still hands out a key rather than refusing.
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn success_clears_cooldown_and_failure_streak() {
        let pool = CredentialPool::new(
            vec!["a".to_string(), "b".to_string()],
            Duration::from_secs(300),
        );
        pool.report_failure("a", "rate limit hit");
        assert_eq!(pool.stats().available, 1);

        pool.report_success("a");
        let stats = pool.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.credentials[0].successes, 1);
        assert_eq!(stats.credentials[0].consecutive_failures, 0);
    }

    #[test]
    fn single_key_pool_never_refuses() {
        let pool = CredentialPool::new(vec!["only".to_string()], Duration::from_secs(300));
        pool.report_failure("only", "429");
        assert_eq!(pool.acquire().as_deref(), Some("only"));
    }

    #[test]
    fn empty_pool_yields_none() {
        let pool = CredentialPool::new(Vec::new(), Duration::from_secs(300));
        assert!(pool.acquire().is_none());
        assert!(pool.is_empty());
    }
}
