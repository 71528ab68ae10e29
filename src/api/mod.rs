//! HTTP surface for event submission and operational queries.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::session::{ArchivedSession, Session};
use crate::models::stage::Stage;
use crate::orchestrator::pipeline::{PipelineOrchestrator, PipelineOutcome};
use crate::orchestrator::session_manager::SessionLocation;
use crate::resilience::recovery::{RecoveryOutcome, RecoveryProcessor, RecoveryReport};
use crate::{AppError, Result};

const DEFAULT_PAGE: u32 = 20;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    /// Pipeline and, through it, sessions, breakers and retry stats.
    pub pipeline: Arc<PipelineOrchestrator>,
    /// Dead-letter recovery processor.
    pub recovery: Arc<RecoveryProcessor>,
}

/// [`AppError`] rendered as a JSON HTTP response.
pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::SessionNotFound(_) | AppError::ArchiveNotFound(_) => StatusCode::NOT_FOUND,
            AppError::RecoveryExhausted(_) => StatusCode::CONFLICT,
            AppError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Transport(_) | AppError::AgentLogic(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Db(_) | AppError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({ "error": self.0.kind(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn default_source_agent() -> String {
    "api".into()
}

/// Body of `POST /events`.
#[derive(Debug, Deserialize)]
pub struct EventSubmission {
    /// Raw event data.
    pub event: Value,
    /// Agent credited as the event source.
    #[serde(default = "default_source_agent")]
    pub source_agent: String,
}

#[derive(Debug, Deserialize)]
struct Page {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    /// Comma-separated tags, all of which must match.
    #[serde(default)]
    tags: String,
}

#[derive(Debug, Deserialize)]
struct ArchiveParams {
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct AgentHealth {
    stage: Stage,
    agent_id: &'static str,
    url: Option<String>,
    healthy: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "location", rename_all = "snake_case")]
enum SessionView {
    Active { session: Session },
    Archived { archive: ArchivedSession },
}

/// Build the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(submit_event))
        .route("/status", get(status))
        .route("/sessions/archived", get(list_archived))
        .route("/sessions/search", get(search_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/archive", post(archive_session))
        .route("/sessions/{id}/restore", post(restore_session))
        .route("/dlq/stats", get(dlq_stats))
        .route("/dlq/{id}/recover", post(recover_event))
        .with_state(state)
}

/// Serve the API on `listener` until `cancel` fires.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve(listener: TcpListener, state: ApiState, cancel: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http api listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("http api shut down");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn submit_event(
    State(state): State<ApiState>,
    Json(submission): Json<EventSubmission>,
) -> (StatusCode, Json<PipelineOutcome>) {
    let outcome = state
        .pipeline
        .process_event(submission.event, &submission.source_agent)
        .await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(outcome))
}

async fn status(State(state): State<ApiState>) -> ApiResult<Value> {
    let pipeline = &state.pipeline;
    let mut agents = Vec::with_capacity(Stage::ALL.len());
    for stage in Stage::ALL {
        agents.push(AgentHealth {
            stage,
            agent_id: stage.agent_id(),
            url: pipeline.registry().resolve(stage),
            healthy: pipeline.registry().is_healthy(stage).await,
        });
    }
    let sessions = pipeline.sessions().stats().await?;

    Ok(Json(json!({
        "pipeline": pipeline.stats(),
        "retry": pipeline.retry_executor().stats(),
        "circuit_breakers": {
            "stats": pipeline.breakers().stats(),
            "targets": pipeline.breakers().all_status(),
        },
        "sessions": sessions,
        "agents": agents,
    })))
}

async fn get_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<SessionView> {
    let sessions = state.pipeline.sessions();
    match sessions.locate(&id).await? {
        Some(SessionLocation::Active) => sessions
            .get_session(&id)
            .await
            .map(|session| Json(SessionView::Active { session }))
            .ok_or_else(|| AppError::SessionNotFound(id).into()),
        Some(SessionLocation::Archived) => {
            let archive = sessions.archived_info(&id).await?;
            Ok(Json(SessionView::Archived { archive }))
        }
        None => Err(AppError::SessionNotFound(id).into()),
    }
}

async fn list_archived(
    State(state): State<ApiState>,
    Query(page): Query<Page>,
) -> ApiResult<Vec<ArchivedSession>> {
    let list = state
        .pipeline
        .sessions()
        .list_archived(page.limit.unwrap_or(DEFAULT_PAGE), page.offset.unwrap_or(0))
        .await?;
    Ok(Json(list))
}

async fn search_sessions(
    State(state): State<ApiState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Vec<ArchivedSession>> {
    let tags: Vec<String> = params
        .tags
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
        .collect();
    let found = state.pipeline.sessions().search(&params.q, &tags).await?;
    Ok(Json(found))
}

async fn archive_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<ArchiveParams>,
) -> ApiResult<ArchivedSession> {
    let reason = params.reason.unwrap_or_else(|| "manual".into());
    let archived = state.pipeline.sessions().archive_session(&id, &reason).await?;
    Ok(Json(archived))
}

async fn restore_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Session> {
    let session = state.pipeline.sessions().restore_session(&id).await?;
    Ok(Json(session))
}

async fn dlq_stats(State(state): State<ApiState>) -> ApiResult<RecoveryReport> {
    Ok(Json(state.recovery.report().await?))
}

async fn recover_event(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<RecoveryOutcome> {
    Ok(Json(state.recovery.recover_one(&id).await?))
}
