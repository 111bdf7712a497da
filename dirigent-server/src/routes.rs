//! HTTP route handlers for the control-plane API.

use axum::Router;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use dirigent::events::Envelope;
use dirigent::run::types::{ApprovalDecision, StageReport, ValidationReport};
use dirigent::run::workflow::WorkflowError;
use dirigent::sandbox::SandboxError;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/run/from-input", post(submit_run))
        .route("/run/{run_id}/approve", post(approve_run))
        .route("/run/{run_id}/cancel", post(cancel_run))
        .route("/run/{run_id}/status", get(run_status))
        .route("/agent/{run_id}/report", post(agent_report))
        .route("/agent/{run_id}/task_complete", post(task_complete))
        .route("/agent/{run_id}/validation_result", post(validation_result))
        .route("/tools/filesystem/write", post(fs_write))
        .route("/tools/filesystem/read", post(fs_read))
        .route("/tools/filesystem/list", post(fs_list))
        .route("/models/status", get(models_status))
        .route("/models/{backend}/ensure", post(models_ensure))
        .route("/models/cleanup", post(models_cleanup))
}

/// `{success: false, error}` with an appropriate status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        let status = match &err {
            WorkflowError::UnknownRun(_) => StatusCode::NOT_FOUND,
            WorkflowError::NoPendingApproval { .. }
            | WorkflowError::InvalidState { .. }
            | WorkflowError::ArtifactMissing { .. }
            | WorkflowError::Transition(_) => StatusCode::BAD_REQUEST,
            WorkflowError::Sandbox(e) => sandbox_status(e),
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        Self {
            status: sandbox_status(&err),
            message: err.to_string(),
        }
    }
}

fn sandbox_status(err: &SandboxError) -> StatusCode {
    match err {
        SandboxError::Escape { .. } | SandboxError::NotADirectory { .. } => {
            StatusCode::BAD_REQUEST
        }
        SandboxError::NotFound { .. } => StatusCode::NOT_FOUND,
        SandboxError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health() -> &'static str {
    "ok"
}

/// POST /run/from-input - accept a document upload and start a run.
async fn submit_run(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut document = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("document") {
            let text = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(format!("unreadable document field: {e}")))?;
            document = Some(text);
        }
    }
    let Some(document) = document else {
        return Err(ApiError::bad_request("missing multipart field 'document'"));
    };
    if document.trim().is_empty() {
        return Err(ApiError::bad_request("document is empty"));
    }

    let run_id = state.workflow.submit(&document).await?;
    Ok(Json(json!({ "run_id": run_id })))
}

/// POST /run/:run_id/approve - resolve a pending approval gate.
async fn approve_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<Json<Value>, ApiError> {
    state.workflow.approve(&run_id, decision).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /run/:run_id/cancel - cooperative cancellation.
async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.workflow.cancel(&run_id).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /run/:run_id/status - current state of a run.
async fn run_status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run_state = state.workflow.state_of(&run_id).await?;
    Ok(Json(json!({ "run_id": run_id, "state": run_state })))
}

/// POST /agent/:run_id/report - forward a worker envelope to the run's
/// subscriber. Malformed envelopes are rejected without touching run state.
async fn agent_report(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let envelope = validate_envelope(&body).map_err(ApiError::bad_request)?;
    // The run must exist, but its state is irrelevant to plain forwarding.
    state.workflow.state_of(&run_id).await?;
    state.events.publish(&run_id, envelope);
    Ok(Json(json!({ "success": true })))
}

/// POST /agent/:run_id/task_complete - stage completion report.
async fn task_complete(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(report): Json<StageReport>,
) -> Result<Json<Value>, ApiError> {
    state.workflow.report_stage_outcome(&run_id, report).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /agent/:run_id/validation_result - validation verdict.
async fn validation_result(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(report): Json<ValidationReport>,
) -> Result<Json<Value>, ApiError> {
    state.workflow.report_validation(&run_id, report).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct WriteRequest {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct PathRequest {
    path: String,
}

/// POST /tools/filesystem/write
async fn fs_write(
    State(state): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> Result<Json<Value>, ApiError> {
    state.sandbox.write(&req.path, &req.content)?;
    Ok(Json(json!({ "success": true, "path": req.path })))
}

/// POST /tools/filesystem/read
async fn fs_read(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> Result<Json<Value>, ApiError> {
    let content = state.sandbox.read(&req.path)?;
    Ok(Json(json!({ "success": true, "content": content })))
}

/// POST /tools/filesystem/list
async fn fs_list(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> Result<Json<Value>, ApiError> {
    let listing = state.sandbox.list(&req.path)?;
    Ok(Json(json!({
        "success": true,
        "files": listing.files,
        "directories": listing.directories,
    })))
}

/// GET /models/status - local model and credential pool snapshot.
async fn models_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let models = state.lifecycle.stats().await.map_err(|e| {
        warn!(err = %e, "model runtime unavailable");
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: format!("model runtime unavailable: {e}"),
        }
    })?;
    Ok(Json(json!({
        "models": models,
        "credentials": state.credentials.stats(),
    })))
}

/// POST /models/:backend/ensure - load a local model on demand.
async fn models_ensure(
    State(state): State<AppState>,
    Path(backend): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .lifecycle
        .ensure_running(&backend)
        .await
        .map_err(|e| ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: e.to_string(),
        })?;
    Ok(Json(json!({ "success": true, "backend": backend })))
}

/// POST /models/cleanup - unload every managed model.
async fn models_cleanup(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .lifecycle
        .force_stop_all()
        .await
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?;
    Ok(Json(json!({ "success": true })))
}

/// Structural check on a worker envelope: `source`, `type` and `data` must
/// all be present, the first two as non-empty strings, `data` as an object.
fn validate_envelope(body: &Value) -> Result<Envelope, String> {
    let Some(obj) = body.as_object() else {
        return Err("envelope must be a JSON object".to_string());
    };
    let source = obj
        .get("source")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("envelope field 'source' must be a non-empty string")?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("envelope field 'type' must be a non-empty string")?;
    let data = obj
        .get("data")
        .filter(|d| d.is_object())
        .ok_or("envelope field 'data' must be an object")?;
    Ok(Envelope::new(source, kind, data.clone()))
}
