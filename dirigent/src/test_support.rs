//! Test-only scripted fakes for the side-effecting seams.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::backend::ChatBackend;
use crate::llm::error::BackendError;
use crate::llm::local::ModelRuntime;
use crate::sandbox::SandboxFs;
use crate::supervisor::{LaunchError, LaunchRequest, WorkerLauncher};

/// Sandbox rooted in a fresh temporary directory. The directory lives as
/// long as the returned guard.
pub fn temp_sandbox() -> (tempfile::TempDir, SandboxFs) {
    let temp = tempfile::tempdir().expect("create tempdir");
    let sandbox = SandboxFs::new(temp.path()).expect("create sandbox");
    (temp, sandbox)
}

/// Launcher that records requests instead of spawning processes.
///
/// `fail_stages` lists stage names whose launch should fail with a spawn
/// error, for exercising the launch-failure path.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    pub launches: Mutex<Vec<LaunchRequest>>,
    pub fail_stages: Vec<&'static str>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(stage: &'static str) -> Self {
        Self {
            launches: Mutex::new(Vec::new()),
            fail_stages: vec![stage],
        }
    }

    /// Stages launched so far, in order.
    pub fn launched_stages(&self) -> Vec<String> {
        self.launches
            .lock()
            .expect("launcher lock")
            .iter()
            .map(|req| req.stage.as_str().to_string())
            .collect()
    }

    /// Feedback string passed to the most recent launch.
    pub fn last_feedback(&self) -> Option<String> {
        self.launches
            .lock()
            .expect("launcher lock")
            .last()
            .and_then(|req| req.feedback.clone())
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        if self.fail_stages.contains(&request.stage.as_str()) {
            return Err(LaunchError::Spawn {
                program: request
                    .command
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "worker".to_string()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted failure"),
            });
        }
        self.launches
            .lock()
            .expect("launcher lock")
            .push(request.clone());
        Ok(())
    }

    fn terminate(&self, _run_id: &str) {}
}

/// Chat backend returning a scripted sequence of results.
pub struct ScriptedBackend {
    name: String,
    local: bool,
    results: Mutex<Vec<Result<String, BackendError>>>,
    pub calls: Mutex<u32>,
}

impl ScriptedBackend {
    pub fn new(
        name: impl Into<String>,
        local: bool,
        results: Vec<Result<String, BackendError>>,
    ) -> Self {
        Self {
            name: name.into(),
            local,
            results: Mutex::new(results),
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().expect("calls lock")
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn chat(
        &self,
        _model_id: &str,
        _system_prompt: &str,
        _user_prompt: &str,
    ) -> Result<String, BackendError> {
        *self.calls.lock().expect("calls lock") += 1;
        let mut results = self.results.lock().expect("results lock");
        if results.is_empty() {
            return Err(BackendError::Provider {
                backend: self.name.clone(),
                message: "scripted backend exhausted".to_string(),
            });
        }
        results.remove(0)
    }
}

/// In-memory model runtime with instantly-visible starts.
///
/// With `fail_start` set, started models never show up in
/// `running_models`, which exercises the bounded start polling.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    running: Mutex<Vec<String>>,
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub fail_start: bool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ModelRuntime for FakeRuntime {
    async fn running_models(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.running.lock().expect("running lock").clone())
    }

    async fn start(&self, backend: &str) -> anyhow::Result<()> {
        self.started
            .lock()
            .expect("started lock")
            .push(backend.to_string());
        if !self.fail_start {
            self.running
                .lock()
                .expect("running lock")
                .push(backend.to_string());
        }
        Ok(())
    }

    async fn stop(&self, backend: &str) -> anyhow::Result<()> {
        self.stopped
            .lock()
            .expect("stopped lock")
            .push(backend.to_string());
        self.running
            .lock()
            .expect("running lock")
            .retain(|m| m.as_str() != backend);
        Ok(())
    }
}
