//! In-memory run records and the per-run locking registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::run::state::RunState;
use crate::run::types::{ApprovalKind, RetryRecord};

/// One end-to-end pipeline execution for one submitted document.
///
/// Mutated only while its registry mutex is held, which serializes
/// transitions per run; no two transitions ever race on one run.
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub state: RunState,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    /// Present only while the run is inside the design retry cycle.
    pub retry: Option<RetryRecord>,
    /// Present only while the run is paused at an approval gate.
    pub gate: Option<ApprovalKind>,
    /// Latest human-readable message / last error reason.
    pub metadata: HashMap<String, String>,
}

/// Transition not permitted by the run-state graph.
#[derive(Debug, Error)]
#[error("run {run_id}: invalid transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub run_id: String,
    pub from: RunState,
    pub to: RunState,
}

impl Run {
    pub fn new(id: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            state: RunState::Initial,
            created_at: now,
            updated_at: now,
            retry: None,
            gate: None,
            metadata: HashMap::new(),
        }
    }

    /// Apply one transition, enforcing the graph.
    pub fn transition(&mut self, to: RunState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                run_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        info!(run_id = %self.id, from = ?self.state, to = ?to, "run transition");
        self.state = to;
        self.updated_at = SystemTime::now();
        Ok(())
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.metadata.insert("message".to_string(), message.into());
    }

    pub fn set_error(&mut self, reason: impl Into<String>) {
        self.metadata.insert("last_error".to_string(), reason.into());
    }
}

/// Registry of all runs for the process lifetime.
///
/// The outer lock only guards the map; each run carries its own async mutex
/// so independent runs never contend while one run's transition is applied.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, Arc<AsyncMutex<Run>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new run in `Initial`.
    pub fn create(&self, run_id: &str) -> Arc<AsyncMutex<Run>> {
        let run = Arc::new(AsyncMutex::new(Run::new(run_id)));
        self.runs
            .lock()
            .expect("run registry lock")
            .insert(run_id.to_string(), run.clone());
        run
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<AsyncMutex<Run>>> {
        self.runs
            .lock()
            .expect("run registry lock")
            .get(run_id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.runs
            .lock()
            .expect("run registry lock")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_rejects_graph_violations() {
        let mut run = Run::new("run-1");
        run.transition(RunState::RequirementsProcessing).expect("start");
        let err = run.transition(RunState::DesignProcessing).unwrap_err();
        assert_eq!(err.from, RunState::RequirementsProcessing);
        // The failed transition left the state untouched.
        assert_eq!(run.state, RunState::RequirementsProcessing);
    }

    #[test]
    fn registry_hands_out_the_same_run() {
        let registry = RunRegistry::new();
        let created = registry.create("run-1");
        let fetched = registry.get("run-1").expect("present");
        assert!(Arc::ptr_eq(&created, &fetched));
        assert!(registry.get("run-2").is_none());
    }
}
