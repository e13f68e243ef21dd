//! HTTP control plane over a Unix domain socket.
//!
//! JSON request/response bodies, SSE for streaming. The socket file is
//! owner-only; any stale socket from a previous daemon lifetime is
//! removed before binding. Every SSE connection starts with an
//! authoritative `state.snapshot`, followed by broker events as they
//! happen.

use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use coven_core::{ErrorCode, EventName, EventPayload};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::process::{ProcessError, ProcessManager};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::state::{StateError, StateStore};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub state: Arc<StateStore>,
    pub processes: Arc<ProcessManager>,
    pub started_at: Instant,
    pub workspace: String,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("workspace", &self.workspace)
            .finish()
    }
}

/// Create the router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/state", get(full_state))
        .route("/events", get(stream_events))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/stop", post(stop_task))
        .route("/workflows", get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/log", get(workflow_log))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workflows/{id}/retry", post(retry_workflow))
        .route("/workflows/{id}/approve-merge", post(approve_merge))
        .route("/workflows/{id}/reject-merge", post(reject_merge))
        .route("/agents", get(list_agents))
        .route("/agents/{id}", get(get_agent))
        .route("/agents/{id}/output", get(agent_output))
        .route("/agents/{id}/kill", post(kill_agent))
        .route("/agents/{id}/respond", post(respond_agent))
        .route("/questions", get(list_questions))
        .route("/questions/{id}", get(get_question))
        .route("/questions/{id}/answer", post(answer_question))
        .route("/session/start", post(session_start))
        .route("/session/stop", post(session_stop))
        .route("/session/status", get(session_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the Unix socket (owner-only) and serve until cancelled.
pub async fn serve_unix(
    socket_path: &FsPath,
    router: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A previous daemon lifetime may have left its socket behind.
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = tokio::net::UnixListener::bind(socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!(socket = %socket_path.display(), "control socket listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

// --- Error shape ---

/// `{"error", "code", "details"?}` with the matching HTTP status.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                code,
                details: None,
            },
        }
    }

    fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match &e {
            SchedulerError::BeadNotFound(_) | SchedulerError::WorkflowNotFound(_) => {
                Self::not_found(e.to_string())
            }
            SchedulerError::AlreadyRunning(_) => {
                Self::new(StatusCode::CONFLICT, ErrorCode::AlreadyRunning, e.to_string())
            }
            SchedulerError::WrongStatus { .. } => {
                Self::new(StatusCode::CONFLICT, ErrorCode::Validation, e.to_string())
            }
            SchedulerError::Spellbook(inner) => Self::new(
                StatusCode::NOT_FOUND,
                ErrorCode::GrimoireNotFound,
                inner.to_string(),
            ),
        }
    }
}

impl From<ProcessError> for ApiError {
    fn from(e: ProcessError) -> Self {
        match &e {
            ProcessError::NotFound(_) => Self::not_found(e.to_string()),
            ProcessError::AlreadyRunning(_) => {
                Self::new(StatusCode::CONFLICT, ErrorCode::AlreadyRunning, e.to_string())
            }
            ProcessError::StdinClosed(_) => {
                Self::new(StatusCode::CONFLICT, ErrorCode::Io, e.to_string())
            }
            ProcessError::ResponseTooLarge => {
                Self::new(StatusCode::CONFLICT, ErrorCode::Validation, e.to_string())
            }
            ProcessError::Spawn(_) | ProcessError::Io(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Io,
                e.to_string(),
            ),
        }
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match &e {
            StateError::QuestionNotFound(_) => Self::not_found(e.to_string()),
            StateError::AlreadyAnswered(_) => Self::new(
                StatusCode::CONFLICT,
                ErrorCode::AlreadyAnswered,
                e.to_string(),
            ),
            StateError::Io(_) | StateError::Malformed(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Persistence,
                e.to_string(),
            ),
        }
    }
}

// --- Info endpoints ---

async fn health(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_sec": app.started_at.elapsed().as_secs(),
        "workspace": app.workspace,
    }))
}

async fn version() -> impl IntoResponse {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "git_commit": option_env!("COVEN_GIT_COMMIT").unwrap_or("unknown"),
        "build_time": option_env!("COVEN_BUILD_TIME").unwrap_or("unknown"),
    }))
}

async fn full_state(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app.state.snapshot_json())
}

// --- SSE ---

async fn stream_events(
    State(app): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (_id, rx) = app.state.broker().subscribe();

    // Late joiners start from an authoritative snapshot.
    let snapshot = coven_core::Envelope::new(
        EventName::StateSnapshot,
        EventPayload::Snapshot(app.state.snapshot_json()),
    );

    let live = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|envelope| (envelope, rx))
    });

    let events = stream::iter(std::iter::once(snapshot))
        .chain(live)
        .map(|envelope| {
            let data = envelope.payload.to_json().unwrap_or_else(|_| "{}".to_string());
            Ok(SseEvent::default().event(envelope.name.as_str()).data(data))
        });

    Sse::new(events).keep_alive(KeepAlive::default())
}

// --- Tasks ---

async fn list_tasks(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "beads": app.state.beads() }))
}

async fn start_task(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow_id = app.scheduler.start_bead(&id)?;
    info!(bead = %id, workflow = %workflow_id, "workflow started via API");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "workflow_id": workflow_id })),
    ))
}

/// How long a graceful stop may take before the API reports 504. The
/// cancellation itself keeps going either way.
const STOP_WAIT: std::time::Duration = std::time::Duration::from_secs(10);

async fn stop_task(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow_id = app.scheduler.stop_bead(&id).await?;

    let deadline = Instant::now() + STOP_WAIT;
    while Instant::now() < deadline {
        if app
            .state
            .workflow(&workflow_id.0)
            .map(|w| w.status.is_terminal())
            .unwrap_or(true)
        {
            return Ok(StatusCode::NO_CONTENT);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    Err(ApiError::new(
        StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Timeout,
        format!("workflow {workflow_id} did not stop within {}s", STOP_WAIT.as_secs()),
    ))
}

// --- Workflows ---

async fn list_workflows(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "workflows": app.state.workflows() }))
}

async fn get_workflow(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = app
        .state
        .workflow(&id)
        .ok_or_else(|| ApiError::not_found(format!("workflow not found: {id}")))?;
    Ok(Json(serde_json::json!({ "workflow": workflow })))
}

async fn workflow_log(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = app
        .state
        .workflow(&id)
        .ok_or_else(|| ApiError::not_found(format!("workflow not found: {id}")))?;
    let path = app.scheduler.params().workflow_log(&workflow.id);
    let log = std::fs::read_to_string(path).unwrap_or_default();
    Ok(([("content-type", "application/x-ndjson")], log))
}

async fn cancel_workflow(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    app.scheduler.cancel_workflow(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_workflow(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    app.scheduler.retry_workflow(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn approve_merge(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    app.scheduler.approve_merge(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct RejectMergeRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn reject_merge(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    // The body is optional; an absent or empty one means no reason.
    let reason = serde_json::from_slice::<RejectMergeRequest>(&body)
        .ok()
        .and_then(|req| req.reason);
    app.scheduler.reject_merge(&id, reason)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Agents ---

async fn list_agents(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "agents": app.state.agents() }))
}

async fn get_agent(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = app
        .processes
        .get_info(&id)
        .or_else(|| app.state.agent(&id))
        .ok_or_else(|| ApiError::not_found(format!("agent not found: {id}")))?;
    Ok(Json(serde_json::json!({ "agent": agent })))
}

#[derive(Debug, Default, Deserialize)]
struct OutputQuery {
    #[serde(default)]
    since: Option<u64>,
}

async fn agent_output(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let lines = match query.since {
        Some(seq) => app.processes.get_output_since(&id, seq)?,
        None => app.processes.get_output(&id)?,
    };
    let last_sequence = lines.last().map(|l| l.sequence);
    Ok(Json(serde_json::json!({
        "lines": lines,
        "last_sequence": last_sequence,
    })))
}

async fn kill_agent(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if app.processes.get_info(&id).is_none() {
        return Err(ApiError::not_found(format!("agent not found: {id}")));
    }
    app.processes.kill(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    response: String,
}

async fn respond_agent(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RespondRequest>,
) -> Result<impl IntoResponse, ApiError> {
    app.processes.respond(&id, &req.response).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Questions ---

async fn list_questions(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "questions": app.state.questions() }))
}

async fn get_question(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let question = app
        .state
        .question(&id)
        .ok_or_else(|| ApiError::not_found(format!("question not found: {id}")))?;
    Ok(Json(serde_json::json!({ "question": question })))
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    answer: String,
}

async fn answer_question(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let question = app.state.answer_question(&id, &req.answer)?;

    // Deliver to the waiting agent. The answer is recorded either way;
    // a dead agent just cannot consume it any more.
    if let Err(e) = app.processes.respond(&question.bead_id, &req.answer).await {
        warn!(question = %id, bead = %question.bead_id, error = %e, "answer could not reach agent stdin");
    }
    Ok(Json(serde_json::json!({ "question": question })))
}

// --- Session ---

async fn session_start(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    app.state.set_session_running(true, &app.workspace);
    info!("session started");
    Json(serde_json::json!({ "running": true }))
}

async fn session_stop(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    app.state.set_session_running(false, &app.workspace);
    info!("session stopped");
    Json(serde_json::json!({ "running": false }))
}

async fn session_status(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let session = app.state.session();
    Json(serde_json::json!({ "session": session }))
}
