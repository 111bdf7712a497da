//! Worker subprocess supervision.
//!
//! The [`WorkerLauncher`] trait decouples the workflow from actual process
//! spawning (tests use a scripted launcher that records requests without
//! forking). The real [`ProcessSupervisor`] spawns one OS subprocess per
//! stage with a fixed command-line contract and tracks the handle; it never
//! waits for completion — workers report back through the control-plane API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::run::types::Stage;

/// Everything needed to start one stage worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub run_id: String,
    pub stage: Stage,
    /// argv prefix for the worker executable (from config).
    pub command: Vec<String>,
    /// Stage input artifact, relative to the project root.
    pub input_path: PathBuf,
    /// Accumulated retry feedback, design stage only.
    pub feedback: Option<String>,
}

/// The subprocess could not be started. Surfaced to the state machine as an
/// immediate stage failure.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no command configured for stage {0}")]
    EmptyCommand(&'static str),
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Abstraction over worker launching backends.
pub trait WorkerLauncher: Send + Sync {
    /// Start the stage worker. Must not block on worker completion.
    fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError>;

    /// Drop all handles belonging to a run that reached a terminal state.
    fn terminate(&self, run_id: &str);
}

#[derive(Debug)]
struct WorkerInvocation {
    child: Child,
    started_at: Instant,
}

/// Launcher that spawns real OS subprocesses.
///
/// Invocation contract: `<command…> --run-id <id> --input-path <path>
/// [--feedback <text>]`. Workers inherit stdio; their user-visible output
/// travels through the report API, not through pipes.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    workers: Mutex<HashMap<(String, Stage), WorkerInvocation>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop invocations whose process has already exited.
    fn prune_exited(&self) {
        let mut workers = self.workers.lock().expect("supervisor lock");
        workers.retain(|(run_id, stage), invocation| {
            match invocation.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(
                        run_id = %run_id,
                        stage = stage.as_str(),
                        exit_code = ?status.code(),
                        elapsed_secs = invocation.started_at.elapsed().as_secs(),
                        "worker exited"
                    );
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(run_id = %run_id, err = %e, "failed to poll worker, dropping handle");
                    false
                }
            }
        });
    }
}

impl WorkerLauncher for ProcessSupervisor {
    fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        self.prune_exited();

        let Some((program, args)) = request.command.split_first() else {
            return Err(LaunchError::EmptyCommand(request.stage.as_str()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--run-id")
            .arg(&request.run_id)
            .arg("--input-path")
            .arg(&request.input_path);
        if let Some(feedback) = &request.feedback {
            cmd.arg("--feedback").arg(feedback);
        }

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;

        info!(
            run_id = %request.run_id,
            stage = request.stage.as_str(),
            pid = ?child.id(),
            "worker launched"
        );

        self.workers.lock().expect("supervisor lock").insert(
            (request.run_id.clone(), request.stage),
            WorkerInvocation {
                child,
                started_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn terminate(&self, run_id: &str) {
        let mut workers = self.workers.lock().expect("supervisor lock");
        let before = workers.len();
        workers.retain(|(id, _), _| id != run_id);
        if workers.len() != before {
            debug!(run_id, "dropped worker handles for terminated run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(run_id: &str, command: Vec<String>) -> LaunchRequest {
        LaunchRequest {
            run_id: run_id.to_string(),
            stage: Stage::Requirements,
            command,
            input_path: PathBuf::from("temp/input.md"),
            feedback: None,
        }
    }

    #[tokio::test]
    async fn launch_registers_a_worker() {
        let supervisor = ProcessSupervisor::new();
        supervisor
            .launch(&request(
                "run-1",
                vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            ))
            .expect("launch");
        assert_eq!(supervisor.workers.lock().expect("lock").len(), 1);

        supervisor.terminate("run-1");
        assert!(supervisor.workers.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let supervisor = ProcessSupervisor::new();
        let err = supervisor
            .launch(&request(
                "run-1",
                vec!["definitely-not-a-real-binary-42".to_string()],
            ))
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let supervisor = ProcessSupervisor::new();
        let err = supervisor.launch(&request("run-1", Vec::new())).unwrap_err();
        assert!(matches!(err, LaunchError::EmptyCommand("requirements")));
    }
}
