//! Bounded in-memory response cache for deterministic task classes.
//!
//! The key hashes only a prefix of each prompt, which keeps hashing cheap
//! and tolerates trailing boilerplate while still separating genuinely
//! different requests. On overflow the oldest fifth of entries is evicted
//! in one sweep so eviction does not run on every insert.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug)]
struct CacheEntry {
    response: String,
    inserted: u64,
}

/// Insertion-ordered cache with bulk eviction.
#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    key_prefix_chars: usize,
    entries: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    map: HashMap<String, CacheEntry>,
    counter: u64,
}

impl ResponseCache {
    pub fn new(capacity: usize, key_prefix_chars: usize) -> Self {
        Self {
            capacity,
            key_prefix_chars,
            entries: Mutex::new(CacheState::default()),
        }
    }

    /// Cache key: hash of each prompt's leading characters, joined with a
    /// separator so prefix boundaries cannot collide.
    pub fn key(&self, system_prompt: &str, user_prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prefix(system_prompt, self.key_prefix_chars));
        hasher.update("|");
        hasher.update(prefix(user_prompt, self.key_prefix_chars));
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.entries.lock().expect("cache lock");
        state.map.get(key).map(|entry| entry.response.clone())
    }

    pub fn put(&self, key: String, response: String) {
        let mut state = self.entries.lock().expect("cache lock");
        state.counter += 1;
        let inserted = state.counter;
        state.map.insert(key, CacheEntry { response, inserted });

        if state.map.len() > self.capacity {
            // Drop the oldest 20% in one pass.
            let evict = (self.capacity / 5).max(1);
            let mut ages: Vec<(u64, String)> = state
                .map
                .iter()
                .map(|(k, entry)| (entry.inserted, k.clone()))
                .collect();
            ages.sort_unstable();
            for (_, key) in ages.into_iter().take(evict) {
                state.map.remove(&key);
            }
            debug!(evicted = evict, remaining = state.map.len(), "cache eviction");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prefix(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
