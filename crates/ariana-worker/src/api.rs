//! Encrypted worker HTTP API.
//!
//! Every endpoint except `GET /health` exchanges bodies sealed with the
//! per-agent cipher. Envelope-level failures reply plaintext `{"error"}` with
//! a 4xx status; application errors are sealed and carry a mirroring status.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::warn;

use ariana_types::CoreError;
use ariana_wire::{
    AutomationEventsRequest, AutomationEventsResponse, Envelope, EnvelopeErrorBody,
    ExecuteAutomationsRequest, ExecuteAutomationsResponse, GenerateCommitNameRequest,
    GenerateCommitNameResponse, GenerateTaskSummaryRequest, GenerateTaskSummaryResponse,
    GitCommitRequest, GitCommitResponse, GitHistoryRequest, GitHistoryResponse,
    GitLastCommitResponse, GitPushRequest, GitPushResponse, HealthResponse, InterruptRequest,
    MessagesResponse, PromptRequest, RestoreSnapshotRequest, RestoreSnapshotResponse,
    SessionStateResponse, StartRequest, StartResponse, StopAutomationRequest,
    TriggerManualAutomationRequest, AutomationEvent,
};

use crate::worker::Worker;

type ApiError = (StatusCode, Json<EnvelopeErrorBody>);

fn envelope_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(EnvelopeErrorBody {
            error: error.to_string(),
        }),
    )
}

fn open<T: DeserializeOwned>(worker: &Worker, envelope: &Envelope) -> Result<T, ApiError> {
    worker.cipher.open(envelope).map_err(|e| {
        warn!(%e, "rejecting undecryptable request");
        envelope_error(StatusCode::BAD_REQUEST, e)
    })
}

fn seal<T: Serialize>(
    worker: &Worker,
    status: StatusCode,
    value: &T,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    worker
        .cipher
        .seal(value)
        .map(|envelope| (status, Json(envelope)))
        .map_err(|e| envelope_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

fn error_status(error: &CoreError) -> StatusCode {
    match error {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Auth(_) => StatusCode::FORBIDDEN,
        CoreError::Cancelled => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn seal_result<T: Serialize>(
    worker: &Worker,
    result: Result<T, CoreError>,
    ok_status: StatusCode,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    match result {
        Ok(value) => seal(worker, ok_status, &value),
        Err(error) => {
            let status = error_status(&error);
            seal(worker, status, &serde_json::json!({ "error": error }))
        }
    }
}

/// Build the worker router.
pub fn router(worker: Arc<Worker>) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/prompt", post(prompt))
        .route("/interrupt", post(interrupt))
        .route("/claudeState", post(claude_state))
        .route("/git-commit", post(git_commit))
        .route("/git-push", post(git_push))
        .route("/git-last-commit", post(git_last_commit))
        .route("/git-history", post(git_history))
        .route("/generate-commit-name", post(generate_commit_name))
        .route("/generate-task-summary", post(generate_task_summary))
        .route("/execute-automations", post(execute_automations))
        .route("/stop-automation", post(stop_automation))
        .route("/trigger-manual-automation", post(trigger_manual_automation))
        .route("/restore-snapshot", post(restore_snapshot))
        .route("/messages", post(messages))
        .route("/automation-events", post(automation_events))
        .route("/health", get(health))
        .with_state(worker)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
}

async fn start(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: StartRequest = open(&worker, &envelope)?;
    let result: Result<StartResponse, CoreError> = worker.start(request).await;
    seal_result(&worker, result, StatusCode::OK)
}

async fn prompt(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: PromptRequest = open(&worker, &envelope)?;
    worker
        .enqueue_prompt(request.prompt_id, request.text, request.model)
        .await;
    seal(
        &worker,
        StatusCode::ACCEPTED,
        &serde_json::json!({ "status": "accepted" }),
    )
}

async fn interrupt(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let _request: InterruptRequest = open(&worker, &envelope)?;
    worker.interrupt().await;
    seal(
        &worker,
        StatusCode::OK,
        &serde_json::json!({ "status": "interrupted" }),
    )
}

async fn claude_state(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let _request: serde_json::Value = open(&worker, &envelope)?;
    let response = SessionStateResponse {
        is_ready: worker.is_ready().await,
        has_blocking_automation: worker.engine.has_blocking().await,
        blocking_automation_ids: worker.engine.blocking_ids().await,
        context_usage: worker.session.get_context_usage().await,
        stop_requested: worker.stop_requested().await,
    };
    seal(&worker, StatusCode::OK, &response)
}

async fn git_commit(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: GitCommitRequest = open(&worker, &envelope)?;

    // Before-commit automations interpose; they are necessarily blocking.
    worker
        .execute_blocking_and_wait(&AutomationEvent::BeforeCommit)
        .await;

    let message = match request.message {
        Some(message) => message,
        None => {
            let diff = worker.git.pending_diff().await.unwrap_or_default();
            worker.generate_commit_name(&diff).await
        }
    };

    let result = worker.git.commit_all(&message).await;
    if matches!(result, Ok(Some(_))) {
        worker
            .execute_automations(&AutomationEvent::AfterCommit)
            .await;
    }
    seal_result(
        &worker,
        result.map(|commit| GitCommitResponse { commit }),
        StatusCode::OK,
    )
}

async fn git_push(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: GitPushRequest = open(&worker, &envelope)?;
    let Some(started) = worker.started_state().await else {
        return seal_result::<GitPushResponse>(
            &worker,
            Err(CoreError::Validation("worker not started".to_string())),
            StatusCode::OK,
        );
    };

    worker
        .execute_blocking_and_wait(&AutomationEvent::BeforePushPr)
        .await;

    let result = worker.git.push(&started.branch_name, request.force).await;
    if result.is_ok() {
        worker
            .execute_automations(&AutomationEvent::AfterPushPr)
            .await;
    }
    seal_result(
        &worker,
        result.map(|pushed_sha| GitPushResponse { pushed_sha }),
        StatusCode::OK,
    )
}

async fn git_last_commit(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let _request: serde_json::Value = open(&worker, &envelope)?;
    let result = worker.git.last_commit().await;
    seal_result(
        &worker,
        result.map(|commit| GitLastCommitResponse { commit }),
        StatusCode::OK,
    )
}

async fn git_history(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: GitHistoryRequest = open(&worker, &envelope)?;
    let result = worker.git.history(request.limit.unwrap_or(100)).await;
    seal_result(
        &worker,
        result.map(|commits| GitHistoryResponse { commits }),
        StatusCode::OK,
    )
}

async fn generate_commit_name(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: GenerateCommitNameRequest = open(&worker, &envelope)?;
    let name = worker.generate_commit_name(&request.diff).await;
    seal(&worker, StatusCode::OK, &GenerateCommitNameResponse { name })
}

async fn generate_task_summary(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: GenerateTaskSummaryRequest = open(&worker, &envelope)?;
    let summary = worker.generate_task_summary(&request.transcript).await;
    seal(
        &worker,
        StatusCode::OK,
        &GenerateTaskSummaryResponse { summary },
    )
}

async fn execute_automations(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: ExecuteAutomationsRequest = open(&worker, &envelope)?;
    let started = worker.execute_automations(&request.event).await;
    seal(
        &worker,
        StatusCode::OK,
        &ExecuteAutomationsResponse { started },
    )
}

async fn stop_automation(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: StopAutomationRequest = open(&worker, &envelope)?;
    let stopped = worker.engine.kill(&request.automation_id).await;
    seal(
        &worker,
        StatusCode::OK,
        &serde_json::json!({ "stopped": stopped }),
    )
}

async fn trigger_manual_automation(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: TriggerManualAutomationRequest = open(&worker, &envelope)?;
    let result = worker
        .engine
        .run_manual(&request.automation_id, crate::script::ScriptVariables::new())
        .await
        .map_err(|e| CoreError::Validation(e.to_string()));
    seal_result(
        &worker,
        result.map(|()| serde_json::json!({ "status": "started" })),
        StatusCode::OK,
    )
}

async fn restore_snapshot(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: RestoreSnapshotRequest = open(&worker, &envelope)?;
    let urls = match (request.presigned_download_url, request.presigned_download_urls) {
        (Some(url), _) => vec![url],
        (None, Some(urls)) => urls,
        (None, None) => Vec::new(),
    };
    let result = worker.restore_snapshot(urls).await;
    seal_result(
        &worker,
        result.map(|()| RestoreSnapshotResponse {
            status: "ok".to_string(),
        }),
        StatusCode::OK,
    )
}

async fn messages(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let _request: serde_json::Value = open(&worker, &envelope)?;
    let messages = worker.wire_messages().await;
    seal(&worker, StatusCode::OK, &MessagesResponse { messages })
}

async fn automation_events(
    State(worker): State<Arc<Worker>>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let request: AutomationEventsRequest = open(&worker, &envelope)?;
    let events = worker.engine.events_after(request.after_seq).await;
    seal(&worker, StatusCode::OK, &AutomationEventsResponse { events })
}

async fn health(State(worker): State<Arc<Worker>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: worker.uptime_seconds(),
    })
}
