//! Approval/retry workflow driving the run state machine.
//!
//! Single ingress for worker completion reports, the two human approval
//! gates, and the bounded design-retry loop. Every operation locks the
//! run's own mutex for its whole critical section, so concurrent reports
//! for one run apply in arrival order while other runs progress freely.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::events::{Envelope, EventHub};
use crate::run::registry::{InvalidTransition, Run, RunRegistry};
use crate::run::state::RunState;
use crate::run::types::{
    ApprovalDecision, ApprovalKind, Stage, StageReport, StageStatus, ValidationReport,
};
use crate::sandbox::{SandboxError, SandboxFs};
use crate::supervisor::{LaunchRequest, WorkerLauncher};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown run {0}")]
    UnknownRun(String),
    #[error("run {run_id} is not waiting for approval (state {state:?})")]
    NoPendingApproval { run_id: String, state: RunState },
    #[error("run {run_id} cannot accept a {what} report in state {state:?}")]
    InvalidState {
        run_id: String,
        state: RunState,
        what: &'static str,
    },
    #[error("stage artifact missing for run {run_id}: {path}")]
    ArtifactMissing { run_id: String, path: String },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// The control-plane root: state machine, gates, and retries for all runs.
pub struct Workflow {
    registry: RunRegistry,
    events: Arc<EventHub>,
    launcher: Arc<dyn WorkerLauncher>,
    sandbox: Arc<SandboxFs>,
    config: OrchestratorConfig,
}

/// Path (relative to the sandbox root) of the submitted input document.
pub fn input_document_path(run_id: &str) -> String {
    format!("temp/{run_id}_input.md")
}

/// Path (relative to the sandbox root) of the machine-readable artifact the
/// requirements stage produces and later stages consume.
pub fn plan_artifact_path(run_id: &str) -> String {
    format!("temp/{run_id}_spec.yml")
}

impl Workflow {
    pub fn new(
        config: OrchestratorConfig,
        sandbox: Arc<SandboxFs>,
        events: Arc<EventHub>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            registry: RunRegistry::new(),
            events,
            launcher,
            sandbox,
            config,
        }
    }

    /// Create a run for `document` and start the requirements stage.
    pub async fn submit(&self, document: &str) -> Result<String, WorkflowError> {
        let run_id = format!("run-{}", Uuid::new_v4());
        let handle = self.registry.create(&run_id);
        let mut run = handle.lock().await;

        self.sandbox
            .write(&input_document_path(&run_id), document)?;

        self.transition(&mut run, RunState::RequirementsProcessing)?;
        self.launch_stage(&mut run, Stage::Requirements, None)?;
        Ok(run_id)
    }

    /// Single ingress for worker completion reports.
    ///
    /// Reports for terminal (including cancelled) runs are silently dropped:
    /// an in-flight worker may legitimately finish after the run ended.
    pub async fn report_stage_outcome(
        &self,
        run_id: &str,
        report: StageReport,
    ) -> Result<(), WorkflowError> {
        let handle = self.run(run_id)?;
        let mut run = handle.lock().await;

        if run.state.is_terminal() {
            debug!(run_id, role = report.role.as_str(), "report for terminal run ignored");
            return Ok(());
        }

        match report.role {
            Stage::Requirements => self.on_requirements_report(&mut run, report),
            Stage::Design => self.on_design_report(&mut run, report),
            Stage::Validation => {
                // Validators normally use the validation_result ingress; a
                // task_complete with the validation role maps onto it.
                let outcome = ValidationReport {
                    success: report.status == StageStatus::Success,
                    message: report.reason.unwrap_or_default(),
                };
                self.on_validation_report(&mut run, outcome)
            }
            Stage::Execution => self.on_execution_report(&mut run, report),
        }
    }

    /// Ingress for the validation worker's pass/fail verdict.
    pub async fn report_validation(
        &self,
        run_id: &str,
        report: ValidationReport,
    ) -> Result<(), WorkflowError> {
        let handle = self.run(run_id)?;
        let mut run = handle.lock().await;

        if run.state.is_terminal() {
            debug!(run_id, "validation result for terminal run ignored");
            return Ok(());
        }
        self.on_validation_report(&mut run, report)
    }

    /// Resolve a pending approval gate.
    pub async fn approve(
        &self,
        run_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), WorkflowError> {
        let handle = self.run(run_id)?;
        let mut run = handle.lock().await;

        let Some(gate) = run.gate else {
            return Err(WorkflowError::NoPendingApproval {
                run_id: run_id.to_string(),
                state: run.state,
            });
        };

        if !decision.approved {
            return self.reject_gate(&mut run, gate, &decision.user_response);
        }

        // File-existence check only; artifact content is the workers' business.
        let artifact = plan_artifact_path(run_id);
        if !self.sandbox.exists(&artifact) {
            run.gate = None;
            let reason = format!("stage artifact not found at {artifact}");
            self.fail_stage(&mut run, gate_stage(gate), &reason)?;
            return Err(WorkflowError::ArtifactMissing {
                run_id: run_id.to_string(),
                path: artifact,
            });
        }

        run.gate = None;
        self.events.publish(
            &run.id,
            Envelope::orchestrator(
                "approval_granted",
                json!({
                    "gate": gate,
                    "user_response": decision.user_response,
                }),
            ),
        );

        match gate {
            ApprovalKind::StartDesign => {
                self.transition(&mut run, RunState::RequirementsApproved)?;
                self.transition(&mut run, RunState::DesignProcessing)?;
                self.launch_stage(&mut run, Stage::Design, None)?;
            }
            ApprovalKind::ExecutePlan => {
                self.transition(&mut run, RunState::DesignApproved)?;
                self.transition(&mut run, RunState::ValidationProcessing)?;
                self.launch_stage(&mut run, Stage::Validation, None)?;
            }
        }
        Ok(())
    }

    /// Cooperatively cancel a run.
    ///
    /// Marks the run `Cancelled` and detaches its subscriber. Workers
    /// already launched keep running; their later reports are dropped by
    /// the terminal-state guard. Cancelling a terminal run is a no-op.
    pub async fn cancel(&self, run_id: &str) -> Result<(), WorkflowError> {
        let handle = self.run(run_id)?;
        let mut run = handle.lock().await;

        if run.state.is_terminal() {
            return Ok(());
        }
        run.gate = None;
        run.retry = None;
        self.transition(&mut run, RunState::Cancelled)?;
        self.events.detach(run_id);
        self.launcher.terminate(run_id);
        Ok(())
    }

    /// Current state of a run, for diagnostics.
    pub async fn state_of(&self, run_id: &str) -> Result<RunState, WorkflowError> {
        let handle = self.run(run_id)?;
        let run = handle.lock().await;
        Ok(run.state)
    }

    /// Retry counter of a run, if it is inside the retry cycle.
    pub async fn retry_count(&self, run_id: &str) -> Result<Option<u32>, WorkflowError> {
        let handle = self.run(run_id)?;
        let run = handle.lock().await;
        Ok(run.retry.as_ref().map(|r| r.count))
    }

    fn run(
        &self,
        run_id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<Run>>, WorkflowError> {
        self.registry
            .get(run_id)
            .ok_or_else(|| WorkflowError::UnknownRun(run_id.to_string()))
    }

    fn on_requirements_report(
        &self,
        run: &mut Run,
        report: StageReport,
    ) -> Result<(), WorkflowError> {
        self.require_state(run, RunState::RequirementsProcessing, "requirements")?;

        match report.status {
            StageStatus::Success => {
                self.publish_summary(run, Stage::Requirements, report.summary.as_deref());
                self.transition(run, RunState::RequirementsWaitingApproval)?;
                self.open_gate(run, ApprovalKind::StartDesign);
                Ok(())
            }
            _ => {
                let reason = report
                    .reason
                    .unwrap_or_else(|| "input document validation failed".to_string());
                self.fail_stage(run, Stage::Requirements, &reason)
            }
        }
    }

    fn on_design_report(&self, run: &mut Run, report: StageReport) -> Result<(), WorkflowError> {
        self.require_state(run, RunState::DesignProcessing, "design")?;

        match report.status {
            StageStatus::Success => {
                self.publish_summary(run, Stage::Design, report.summary.as_deref());
                self.transition(run, RunState::DesignWaitingApproval)?;
                self.open_gate(run, ApprovalKind::ExecutePlan);
                Ok(())
            }
            StageStatus::Incomplete => {
                let reason = report
                    .reason
                    .unwrap_or_else(|| "design incomplete".to_string());
                self.retry_design(run, &reason)
            }
            StageStatus::Failed | StageStatus::Impossible => {
                run.retry = None;
                let reason = report
                    .reason
                    .unwrap_or_else(|| "worker declared the design unachievable".to_string());
                self.fail_stage(run, Stage::Design, &reason)
            }
        }
    }

    fn on_validation_report(
        &self,
        run: &mut Run,
        report: ValidationReport,
    ) -> Result<(), WorkflowError> {
        self.require_state(run, RunState::ValidationProcessing, "validation")?;

        self.events.publish(
            &run.id,
            Envelope::orchestrator(
                "validation_result",
                json!({ "success": report.success, "message": report.message }),
            ),
        );

        if report.success {
            run.retry = None;
            self.transition(run, RunState::ValidationPassed)?;
            if self.config.stages.execution.is_empty() {
                run.set_message("validation passed, run complete");
                self.events
                    .publish(&run.id, Envelope::info("validation passed, run complete"));
            } else {
                self.transition(run, RunState::ExecutionProcessing)?;
                self.launch_stage(run, Stage::Execution, None)?;
            }
            Ok(())
        } else {
            self.transition(run, RunState::ValidationFailed)?;
            let reason = if report.message.is_empty() {
                "validation failed".to_string()
            } else {
                report.message
            };
            self.retry_design(run, &reason)
        }
    }

    fn on_execution_report(&self, run: &mut Run, report: StageReport) -> Result<(), WorkflowError> {
        self.require_state(run, RunState::ExecutionProcessing, "execution")?;

        match report.status {
            StageStatus::Success => {
                self.publish_summary(run, Stage::Execution, report.summary.as_deref());
                self.transition(run, RunState::ExecutionCompleted)?;
                self.events.publish(
                    &run.id,
                    Envelope::orchestrator(
                        "stage_end",
                        json!({ "name": "execution", "status": "completed" }),
                    ),
                );
                self.launcher.terminate(&run.id);
                Ok(())
            }
            _ => {
                let reason = report
                    .reason
                    .unwrap_or_else(|| "execution failed".to_string());
                self.fail_stage(run, Stage::Execution, &reason)
            }
        }
    }

    /// Bounded retry: re-launch the design stage with accumulated feedback,
    /// or reject the run once the counter passes the maximum.
    fn retry_design(&self, run: &mut Run, reason: &str) -> Result<(), WorkflowError> {
        let max_retries = self.config.max_retries;
        let record = run.retry.get_or_insert_with(Default::default);
        let feedback = record.record_failure(reason, max_retries);
        let attempt = record.count;

        if !record.exhausted(max_retries) {
            self.events.publish(
                &run.id,
                Envelope::orchestrator(
                    "retry_attempt",
                    json!({
                        "attempt": attempt,
                        "max_attempts": max_retries,
                        "feedback": feedback,
                    }),
                ),
            );
            self.transition(run, RunState::DesignProcessing)?;
            self.launch_stage(run, Stage::Design, Some(feedback))
        } else {
            warn!(run_id = %run.id, attempts = attempt, "design retries exhausted");
            run.retry = None;
            let summary = format!("exhausted {max_retries} retries, last error: {reason}");
            self.fail_stage(run, Stage::Design, &summary)
        }
    }

    /// Publish `stage_start` and hand the launch request to the supervisor.
    /// A spawn failure is an immediate stage failure, not an API error.
    fn launch_stage(
        &self,
        run: &mut Run,
        stage: Stage,
        feedback: Option<String>,
    ) -> Result<(), WorkflowError> {
        let command = match stage {
            Stage::Requirements => self.config.stages.requirements.clone(),
            Stage::Design => self.config.stages.design.clone(),
            Stage::Validation => self.config.stages.validation.clone(),
            Stage::Execution => self.config.stages.execution.clone(),
        };
        let input_path = match stage {
            Stage::Requirements => input_document_path(&run.id),
            _ => plan_artifact_path(&run.id),
        };

        self.events.publish(
            &run.id,
            Envelope::orchestrator("stage_start", json!({ "name": stage.as_str() })),
        );

        let request = LaunchRequest {
            run_id: run.id.clone(),
            stage,
            command,
            input_path: input_path.into(),
            feedback,
        };
        match self.launcher.launch(&request) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(run_id = %run.id, stage = stage.as_str(), err = %e, "worker launch failed");
                self.fail_stage(run, stage, &format!("failed to launch worker: {e}"))
            }
        }
    }

    /// Terminally reject the run for a stage failure.
    fn fail_stage(&self, run: &mut Run, stage: Stage, reason: &str) -> Result<(), WorkflowError> {
        run.gate = None;
        run.retry = None;
        run.set_error(reason);

        match stage {
            Stage::Requirements => self.transition(run, RunState::RequirementsRejected)?,
            Stage::Design => self.transition(run, RunState::DesignRejected)?,
            Stage::Validation => {
                // A validation stage that cannot even run is a failed
                // validation followed by a terminal rejection.
                self.transition(run, RunState::ValidationFailed)?;
                self.transition(run, RunState::DesignRejected)?;
            }
            Stage::Execution => self.transition(run, RunState::ExecutionFailed)?,
        }

        self.events.publish(
            &run.id,
            Envelope::orchestrator(
                "stage_end",
                json!({ "name": stage.as_str(), "status": "rejected", "reason": reason }),
            ),
        );
        self.launcher.terminate(&run.id);
        Ok(())
    }

    fn reject_gate(
        &self,
        run: &mut Run,
        gate: ApprovalKind,
        user_response: &str,
    ) -> Result<(), WorkflowError> {
        run.gate = None;
        run.retry = None;
        self.events.publish(
            &run.id,
            Envelope::orchestrator(
                "approval_rejected",
                json!({ "gate": gate, "user_response": user_response }),
            ),
        );
        let reason = format!("rejected by user: {user_response}");
        self.fail_stage(run, gate_stage(gate), &reason)
    }

    fn open_gate(&self, run: &mut Run, gate: ApprovalKind) {
        run.gate = Some(gate);
        let (message, next_action) = match gate {
            ApprovalKind::StartDesign => (
                "requirements analysed and plan artifact generated, start the design phase?",
                "start_design",
            ),
            ApprovalKind::ExecutePlan => (
                "execution plan generated, proceed with validation and execution?",
                "execute_plan",
            ),
        };
        self.events.publish(
            &run.id,
            Envelope::orchestrator(
                "approval_request",
                json!({ "gate": gate, "message": message, "next_action": next_action }),
            ),
        );
    }

    fn publish_summary(&self, run: &Run, stage: Stage, summary: Option<&str>) {
        if let Some(summary) = summary {
            self.events.publish(
                &run.id,
                Envelope::orchestrator(
                    "executive_summary",
                    json!({ "summary": summary, "role": stage.as_str() }),
                ),
            );
        }
    }

    fn require_state(
        &self,
        run: &Run,
        expected: RunState,
        what: &'static str,
    ) -> Result<(), WorkflowError> {
        if run.state != expected {
            return Err(WorkflowError::InvalidState {
                run_id: run.id.clone(),
                state: run.state,
                what,
            });
        }
        Ok(())
    }

    fn transition(&self, run: &mut Run, to: RunState) -> Result<(), WorkflowError> {
        run.transition(to)?;
        self.events.publish(
            &run.id,
            Envelope::orchestrator("state_changed", json!({ "state": to })),
        );
        Ok(())
    }
}

fn gate_stage(gate: ApprovalKind) -> Stage {
    match gate {
        ApprovalKind::StartDesign => Stage::Requirements,
        ApprovalKind::ExecutePlan => Stage::Design,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedLauncher, temp_sandbox};

    fn workflow_with(launcher: Arc<ScriptedLauncher>) -> (tempfile::TempDir, Workflow) {
        let (temp, sandbox) = temp_sandbox();
        let sandbox = Arc::new(sandbox);
        let events = Arc::new(EventHub::new());
        let workflow = Workflow::new(
            OrchestratorConfig::default(),
            sandbox,
            events,
            launcher,
        );
        (temp, workflow)
    }

    fn report(role: Stage, status: StageStatus) -> StageReport {
        StageReport {
            role,
            status,
            reason: Some("because".to_string()),
            summary: None,
        }
    }

    #[tokio::test]
    async fn submit_starts_requirements_stage() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (_temp, workflow) = workflow_with(launcher.clone());

        let run_id = workflow.submit("# doc").await.expect("submit");
        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::RequirementsProcessing
        );
        assert_eq!(launcher.launched_stages(), vec!["requirements"]);
    }

    #[tokio::test]
    async fn approve_without_gate_is_invalid_and_mutates_nothing() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (_temp, workflow) = workflow_with(launcher);
        let run_id = workflow.submit("# doc").await.expect("submit");

        for _ in 0..3 {
            let err = workflow
                .approve(
                    &run_id,
                    ApprovalDecision {
                        approved: true,
                        user_response: String::new(),
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::NoPendingApproval { .. }));
        }
        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::RequirementsProcessing
        );
    }

    #[tokio::test]
    async fn requirements_failure_is_terminal() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (_temp, workflow) = workflow_with(launcher);
        let run_id = workflow.submit("# doc").await.expect("submit");

        workflow
            .report_stage_outcome(&run_id, report(Stage::Requirements, StageStatus::Failed))
            .await
            .expect("report");
        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::RequirementsRejected
        );
    }

    #[tokio::test]
    async fn design_impossible_discards_retry_and_rejects() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (_temp, workflow) = workflow_with(launcher);
        let run_id = workflow.submit("# doc").await.expect("submit");

        workflow
            .report_stage_outcome(&run_id, report(Stage::Requirements, StageStatus::Success))
            .await
            .expect("requirements done");
        // Artifact must exist before approval passes the existence check.
        workflow
            .sandbox
            .write(&plan_artifact_path(&run_id), "plan: {}")
            .expect("artifact");
        workflow
            .approve(
                &run_id,
                ApprovalDecision {
                    approved: true,
                    user_response: "go".to_string(),
                },
            )
            .await
            .expect("approve");

        workflow
            .report_stage_outcome(&run_id, report(Stage::Design, StageStatus::Incomplete))
            .await
            .expect("incomplete");
        assert_eq!(workflow.retry_count(&run_id).await.expect("count"), Some(1));

        workflow
            .report_stage_outcome(&run_id, report(Stage::Design, StageStatus::Impossible))
            .await
            .expect("impossible");
        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::DesignRejected
        );
        assert_eq!(workflow.retry_count(&run_id).await.expect("count"), None);
    }

    #[tokio::test]
    async fn retry_exhaustion_rejects_the_design() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (_temp, workflow) = workflow_with(launcher.clone());
        let run_id = workflow.submit("# doc").await.expect("submit");

        workflow
            .report_stage_outcome(&run_id, report(Stage::Requirements, StageStatus::Success))
            .await
            .expect("requirements done");
        workflow
            .sandbox
            .write(&plan_artifact_path(&run_id), "plan: {}")
            .expect("artifact");
        workflow
            .approve(
                &run_id,
                ApprovalDecision {
                    approved: true,
                    user_response: String::new(),
                },
            )
            .await
            .expect("approve");

        // Default max_retries is 3: attempts 1..=3 relaunch, the 4th rejects.
        for _ in 0..3 {
            workflow
                .report_stage_outcome(&run_id, report(Stage::Design, StageStatus::Incomplete))
                .await
                .expect("incomplete");
            assert_eq!(
                workflow.state_of(&run_id).await.expect("state"),
                RunState::DesignProcessing
            );
        }
        workflow
            .report_stage_outcome(&run_id, report(Stage::Design, StageStatus::Incomplete))
            .await
            .expect("final incomplete");

        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::DesignRejected
        );
        assert_eq!(workflow.retry_count(&run_id).await.expect("count"), None);
        // requirements + first design + 3 retries
        assert_eq!(launcher.launched_stages().len(), 5);
        assert!(
            launcher
                .last_feedback()
                .expect("feedback")
                .contains("Previous errors")
        );
    }

    #[tokio::test]
    async fn launch_failure_is_an_immediate_stage_failure() {
        let launcher = Arc::new(ScriptedLauncher::failing_on("requirements"));
        let (_temp, workflow) = workflow_with(launcher);
        let run_id = workflow.submit("# doc").await.expect("submit");

        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::RequirementsRejected
        );
    }

    #[tokio::test]
    async fn approving_with_missing_artifact_rejects_the_run() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (_temp, workflow) = workflow_with(launcher);
        let run_id = workflow.submit("# doc").await.expect("submit");

        workflow
            .report_stage_outcome(&run_id, report(Stage::Requirements, StageStatus::Success))
            .await
            .expect("requirements done");

        let err = workflow
            .approve(
                &run_id,
                ApprovalDecision {
                    approved: true,
                    user_response: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ArtifactMissing { .. }));
        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::RequirementsRejected
        );
    }

    #[tokio::test]
    async fn reports_after_cancellation_are_silently_dropped() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (_temp, workflow) = workflow_with(launcher);
        let run_id = workflow.submit("# doc").await.expect("submit");

        workflow.cancel(&run_id).await.expect("cancel");
        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::Cancelled
        );

        workflow
            .report_stage_outcome(&run_id, report(Stage::Requirements, StageStatus::Success))
            .await
            .expect("ignored");
        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::Cancelled
        );
    }

    #[tokio::test]
    async fn rejecting_the_execute_plan_gate_terminates_the_run() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (_temp, workflow) = workflow_with(launcher);
        let run_id = workflow.submit("# doc").await.expect("submit");

        workflow
            .report_stage_outcome(&run_id, report(Stage::Requirements, StageStatus::Success))
            .await
            .expect("requirements done");
        workflow
            .sandbox
            .write(&plan_artifact_path(&run_id), "plan: {}")
            .expect("artifact");
        workflow
            .approve(
                &run_id,
                ApprovalDecision {
                    approved: true,
                    user_response: String::new(),
                },
            )
            .await
            .expect("approve design");
        workflow
            .report_stage_outcome(&run_id, report(Stage::Design, StageStatus::Success))
            .await
            .expect("design done");

        workflow
            .approve(
                &run_id,
                ApprovalDecision {
                    approved: false,
                    user_response: "not like this".to_string(),
                },
            )
            .await
            .expect("reject");
        assert_eq!(
            workflow.state_of(&run_id).await.expect("state"),
            RunState::DesignRejected
        );
    }
}
