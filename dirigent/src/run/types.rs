//! Wire-facing contract types between workers and the control plane.
//!
//! Worker reports arrive as JSON; the free-form `role`/`status` strings of
//! the protocol decode into these enums at the API boundary, so unknown
//! values become structural errors instead of silently falling through.

use serde::{Deserialize, Serialize};

/// Pipeline stage, one worker process type each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Requirements,
    #[serde(alias = "planner")]
    Design,
    #[serde(alias = "validator")]
    Validation,
    Execution,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Requirements => "requirements",
            Stage::Design => "design",
            Stage::Validation => "validation",
            Stage::Execution => "execution",
        }
    }
}

/// Worker-declared completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Failed,
    Incomplete,
    Impossible,
}

/// Which approval point a run is paused at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Requirements are in; waiting for a human to start design planning.
    StartDesign,
    /// The plan is in; waiting for a human to execute it.
    ExecutePlan,
}

/// Completion report posted by a stage worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub role: Stage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Result posted by the validation worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Human decision on a pending approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default)]
    pub user_response: String,
}

/// Bounded retry bookkeeping for the design stage.
///
/// Exists only while the run is in a retryable cycle; dropped on success or
/// exhaustion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryRecord {
    pub count: u32,
    pub reasons: Vec<String>,
}

impl RetryRecord {
    /// Record one more failure and build the enriched feedback string handed
    /// to the relaunched design worker: the current reason plus a summary of
    /// everything that failed before it.
    pub fn record_failure(&mut self, reason: &str, max_retries: u32) -> String {
        self.count += 1;
        self.reasons.push(reason.to_string());

        let mut feedback = format!(
            "Attempt {}/{}. Error: {}",
            self.count, max_retries, reason
        );
        if self.reasons.len() > 1 {
            let prior = self.reasons[..self.reasons.len() - 1].join("; ");
            feedback.push_str(&format!(" Previous errors: {prior}"));
        }
        feedback
    }

    pub fn exhausted(&self, max_retries: u32) -> bool {
        self.count > max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_fails_to_decode() {
        let err = serde_json::from_str::<StageReport>(
            r#"{"role":"design","status":"exploded"}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn legacy_role_aliases_decode() {
        let report: StageReport =
            serde_json::from_str(r#"{"role":"planner","status":"incomplete"}"#).expect("decode");
        assert_eq!(report.role, Stage::Design);
        assert_eq!(report.status, StageStatus::Incomplete);
    }

    #[test]
    fn feedback_accumulates_prior_reasons() {
        let mut retry = RetryRecord::default();
        let first = retry.record_failure("schema invalid", 3);
        assert_eq!(first, "Attempt 1/3. Error: schema invalid");

        let second = retry.record_failure("missing diagram", 3);
        assert!(second.starts_with("Attempt 2/3. Error: missing diagram"));
        assert!(second.contains("Previous errors: schema invalid"));
        assert!(!retry.exhausted(3));

        retry.record_failure("still broken", 3);
        retry.record_failure("again", 3);
        assert!(retry.exhausted(3));
    }
}
