//! HTTP surface over one sandbox runtime.
//!
//! Run operations answer immediately with the admitted run; progress is read
//! from the `*/events` endpoints as Server-Sent Events. Each SSE frame carries
//! one JSON-encoded [`RunEvent`]. A listener that attaches while no run of
//! that kind is active gets `204 No Content`.

use anyhow::Context;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::exec::EventStream;
use crate::runtime::{
    AgentRequest, Handle, Profile, RunEvent, RunKind, RunStatus, RuntimeError, SandboxRuntime,
};

const KEEP_ALIVE_SECS: u64 = 15;

#[derive(Clone)]
pub(crate) struct AppState {
    pub runtime: SandboxRuntime,
    /// Where `sandbox.toml` is re-read from on `POST /init`.
    pub project_dir: PathBuf,
}

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum ApiError {
    Runtime(RuntimeError),
    Config(anyhow::Error),
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Runtime(e) => {
                let status = match &e {
                    RuntimeError::NotInitialized => StatusCode::CONFLICT,
                    e if e.is_precondition() => StatusCode::UNPROCESSABLE_ENTITY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            Self::Config(e) => (StatusCode::UNPROCESSABLE_ENTITY, format!("{e:#}")),
        };

        if status.is_server_error() {
            error!("Request failed: {}", message);
        } else {
            warn!("Request rejected: {}", message);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// -----------------------------------------------------------------------------
// Bodies
// -----------------------------------------------------------------------------

/// Summary of an admitted run.
#[derive(Debug, Serialize)]
struct RunSummary {
    id: String,
    kind: RunKind,
    status: RunStatus,
}

impl From<&Arc<Handle>> for RunSummary {
    fn from(handle: &Arc<Handle>) -> Self {
        Self {
            id: handle.id().to_string(),
            kind: handle.kind(),
            status: handle.status(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommitBody {
    title: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct ShaBody {
    sha: String,
}

// -----------------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------------

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/init", post(init))
        .route("/start", post(start))
        .route("/start/wait", post(wait_until_started))
        .route("/start/events", get(start_events))
        .route("/deploy", post(deploy))
        .route("/deploy/events", get(deploy_events))
        .route(
            "/agent",
            post(start_agent).delete(stop_agent).get(agent_running),
        )
        .route("/agent/events", get(agent_events))
        .route("/git/commit", post(git_commit))
        .route("/git/reset", post(git_reset))
        .route("/git/head", get(git_head))
        .route("/git/push", post(git_push))
        .with_state(state)
}

/// Serves `state` on `bind` until Ctrl+C.
pub(crate) async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
            }
        })
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

async fn init(State(state): State<AppState>) -> ApiResult<StatusCode> {
    let config = Config::load(&state.project_dir).map_err(ApiError::Config)?;
    state.runtime.init(Profile::from_config(&config));
    Ok(StatusCode::NO_CONTENT)
}

async fn start(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let handle = state.runtime.start().await?;
    Ok((StatusCode::ACCEPTED, Json(RunSummary::from(&handle))))
}

async fn wait_until_started(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.runtime.wait_until_started().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deploy(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let handle = state.runtime.deploy().await?;
    Ok((StatusCode::ACCEPTED, Json(RunSummary::from(&handle))))
}

async fn start_agent(
    State(state): State<AppState>,
    Json(request): Json<AgentRequest>,
) -> ApiResult<impl IntoResponse> {
    let handle = state.runtime.start_agent(request).await?;
    Ok((StatusCode::ACCEPTED, Json(RunSummary::from(&handle))))
}

async fn stop_agent(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stopped = state.runtime.stop_agent().await;
    Json(json!({ "stopped": stopped }))
}

async fn agent_running(State(state): State<AppState>) -> Json<serde_json::Value> {
    let running = state.runtime.is_agent_running().await;
    Json(json!({ "running": running }))
}

async fn start_events(State(state): State<AppState>) -> Response {
    sse(state.runtime.listen_to_start().await)
}

async fn deploy_events(State(state): State<AppState>) -> Response {
    sse(state.runtime.listen_to_deploy().await)
}

async fn agent_events(State(state): State<AppState>) -> Response {
    sse(state.runtime.listen_to_agent().await)
}

fn sse(stream: Option<EventStream<RunEvent>>) -> Response {
    let Some(stream) = stream else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let frames = stream.map(|event| Event::default().json_data(event));
    let sse = Sse::new(frames)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_SECS)));
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        sse,
    )
        .into_response()
}

async fn git_commit(
    State(state): State<AppState>,
    Json(body): Json<CommitBody>,
) -> ApiResult<Json<ShaBody>> {
    let sha = state.runtime.git_commit(&body.title, &body.body).await?;
    Ok(Json(ShaBody { sha }))
}

async fn git_reset(
    State(state): State<AppState>,
    Json(body): Json<ShaBody>,
) -> ApiResult<StatusCode> {
    state.runtime.git_reset(&body.sha).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn git_head(State(state): State<AppState>) -> ApiResult<Json<ShaBody>> {
    let sha = state.runtime.git_current_commit().await?;
    Ok(Json(ShaBody { sha }))
}

async fn git_push(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.runtime.git_push().await?;
    Ok(StatusCode::NO_CONTENT)
}
