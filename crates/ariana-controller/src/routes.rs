//! User-facing controller API.
//!
//! Thin HTTP shell over the orchestrator. Authentication lives upstream; the
//! gateway forwards the authenticated user in `x-user-id` and the client
//! address in `x-forwarded-for`. Errors come back as structured JSON with a
//! status mirroring the error kind.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use ariana_store::AgentFilter;
use ariana_types::{AgentId, CoreError, EnvironmentId, ProjectId, UserId};
use ariana_wire::SetupMode;

use crate::orchestrator::{CreateAgentRequest, Orchestrator};

/// Shared route state.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator every route delegates to.
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the controller router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/agents", get(list_agents).post(create_agent))
        .route("/agents/:id/prompts", post(submit_prompt))
        .route("/agents/:id/interrupt", post(interrupt))
        .route("/agents/:id/archive", post(archive))
        .route("/agents/:id/fork", post(fork))
        .route("/agents/:id/reboot", post(reboot))
        .route("/agents/:id/commit", post(commit))
        .route("/agents/:id/push", post(push))
        .route("/agents/:id/ports/:port", post(expose_port))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
}

struct ApiFailure(CoreError);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Auth(_) => StatusCode::FORBIDDEN,
            CoreError::Quota(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::SnapshotMissing { .. } => StatusCode::NOT_FOUND,
            CoreError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0,
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiFailure {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

fn caller(headers: &HeaderMap) -> Result<UserId, ApiFailure> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| UserId(v.to_string()))
        .ok_or_else(|| ApiFailure(CoreError::Auth("missing x-user-id".to_string())))
}

fn caller_ip(headers: &HeaderMap) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

//─────────────────────────────
//  Payloads
//─────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateAgentBody {
    project_id: String,
    name: Option<String>,
    environment_id: Option<String>,
    setup: SetupMode,
    #[serde(default = "default_base_branch")]
    base_branch: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Serialize)]
struct CreateAgentReply {
    agent_id: AgentId,
}

#[derive(Debug, Deserialize)]
struct PromptBody {
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct ForkBody {
    #[serde(default)]
    force_new_agent: bool,
}

#[derive(Debug, Deserialize, Default)]
struct CommitBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PushBody {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct HealthReply {
    status: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct StatusReply {
    active_machines: usize,
    max_machines: usize,
}

//─────────────────────────────
//  Handlers
//─────────────────────────────

async fn health() -> Json<HealthReply> {
    Json(HealthReply {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusReply>, ApiFailure> {
    let active = state
        .orchestrator
        .pool
        .active_count()
        .await
        .map_err(|e| ApiFailure(CoreError::Validation(e.to_string())))?;
    Ok(Json(StatusReply {
        active_machines: active,
        max_machines: state.orchestrator.pool.capacity(),
    }))
}

async fn list_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let user = caller(&headers)?;
    let agents = state
        .orchestrator
        .repos
        .agents
        .find_many(AgentFilter {
            user_id: Some(user),
            ..AgentFilter::default()
        })
        .await
        .map_err(|e| ApiFailure(CoreError::Validation(e.to_string())))?;
    Ok(Json(serde_json::json!({ "agents": agents })))
}

async fn create_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateAgentBody>,
) -> Result<(StatusCode, Json<CreateAgentReply>), ApiFailure> {
    let user = caller(&headers)?;
    let ip = caller_ip(&headers);
    let agent_id = state
        .orchestrator
        .create(CreateAgentRequest {
            project_id: ProjectId(body.project_id),
            user_id: user,
            ip,
            name: body.name,
            environment_id: body.environment_id.map(EnvironmentId),
            setup: body.setup,
            base_branch: body.base_branch,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(CreateAgentReply { agent_id })))
}

async fn submit_prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PromptBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiFailure> {
    let user = caller(&headers)?;
    let prompt_id = state
        .orchestrator
        .submit_prompt(&AgentId(id), &user, body.text)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "prompt_id": prompt_id })),
    ))
}

async fn interrupt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let user = caller(&headers)?;
    state.orchestrator.interrupt(&AgentId(id), &user).await?;
    Ok(Json(serde_json::json!({ "status": "interrupted" })))
}

async fn archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let user = caller(&headers)?;
    let agent_id = AgentId(id);
    let agent = state.orchestrator.must_find(&agent_id).await?;
    if agent.user_id != user {
        return Err(ApiFailure(CoreError::Auth("not the agent owner".to_string())));
    }
    state.orchestrator.archive(&agent_id).await?;
    Ok(Json(serde_json::json!({ "status": "archived" })))
}

async fn fork(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ForkBody>>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let user = caller(&headers)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let target = state
        .orchestrator
        .fork(&AgentId(id), &user, body.force_new_agent)
        .await?;
    Ok(Json(serde_json::json!({ "target_agent_id": target })))
}

async fn reboot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let user = caller(&headers)?;
    let target = state.orchestrator.reboot(&AgentId(id), &user).await?;
    Ok(Json(serde_json::json!({ "target_agent_id": target })))
}

async fn commit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<CommitBody>>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let user = caller(&headers)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let commit = state
        .orchestrator
        .commit(&AgentId(id), &user, body.message)
        .await?;
    Ok(Json(serde_json::json!({ "commit": commit })))
}

async fn push(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<PushBody>>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let user = caller(&headers)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let pushed_sha = state
        .orchestrator
        .push(&AgentId(id), &user, body.force)
        .await?;
    Ok(Json(serde_json::json!({ "pushed_sha": pushed_sha })))
}

async fn expose_port(
    State(state): State<AppState>,
    Path((id, port)): Path<(String, u16)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let user = caller(&headers)?;
    let agent_id = AgentId(id);
    let agent = state.orchestrator.must_find(&agent_id).await?;
    if agent.user_id != user {
        return Err(ApiFailure(CoreError::Auth("not the agent owner".to_string())));
    }
    let machine = state.orchestrator.machine_of(&agent).await?;
    let host = state
        .orchestrator
        .gateway
        .register(&agent_id, port, &machine.ipv4);
    Ok(Json(serde_json::json!({ "host": host })))
}
