//! HTTP API.
//!
//! `POST /api/hooks` is the direct-call transport for hook scripts; the rest
//! serves dashboards and the terminal manager.
//!
//! | route | purpose |
//! |---|---|
//! | `POST /api/hooks` | ingest one hook payload |
//! | `GET /api/sessions` | all sessions |
//! | `GET /api/sessions/{id}` | one session |
//! | `PATCH /api/sessions/{id}` | title, label, archive flag, queue count |
//! | `POST /api/sessions/{id}/resume` | arm a resume in a terminal |
//! | `GET /api/teams` | all teams |
//! | `GET /api/events?since=N` | replay entries after `N` |
//! | `GET /api/stats` | hook and queue counters |
//! | `GET/POST /api/terminals` | list or provision terminals |
//! | `DELETE /api/terminals/{id}` | terminal closed |
//! | `GET /health` | liveness probe |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crew_core::{Session, SessionId, Team};
use crew_protocol::{ProtocolVersion, ReplayEntry};

use crate::queue::{QueueCounters, QueueStats};
use crate::registry::{RegistryError, RegistryHandle, SessionPatch};
use crate::server::ServerError;
use crate::stats::{StatsSnapshot, Transport};
use crate::terminal::{LocalTerminals, TerminalRecord, TerminalSpec};

/// Shared by every handler.
#[derive(Clone)]
pub struct ApiState {
    pub registry: RegistryHandle,
    pub terminals: LocalTerminals,
    /// Present when the file queue is enabled.
    pub queue: Option<Arc<QueueCounters>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/hooks", post(ingest_hook))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).patch(update_session))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/teams", get(list_teams))
        .route("/api/events", get(replay_events))
        .route("/api/stats", get(stats))
        .route("/api/terminals", get(list_terminals).post(provision_terminal))
        .route("/api/terminals/{id}", axum::routing::delete(close_terminal))
        .with_state(state)
}

/// Serves the API until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::HttpBind {
            addr,
            error: e.to_string(),
        })?;
    info!(%addr, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            debug!("HTTP API shutting down");
        })
        .await
        .map_err(|e| ServerError::HttpServe(e.to_string()))
}

// ============================================================================
// Errors
// ============================================================================

/// A JSON `{"error": ...}` response with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match err {
            RegistryError::Invalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::NotResumable { .. } => StatusCode::CONFLICT,
            RegistryError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "protocolVersion": ProtocolVersion::CURRENT.to_string(),
    }))
}

async fn ingest_hook(
    State(state): State<ApiState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(payload) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Unreadable hook body");
        ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    })?;

    let outcome = state.registry.ingest(payload, Transport::Http).await?;
    Ok(Json(json!({
        "ok": true,
        "sessionId": outcome.session_id,
        "resolution": outcome.resolution,
    })))
}

async fn list_sessions(State(state): State<ApiState>) -> Json<Vec<Session>> {
    Json(state.registry.get_all_sessions().await)
}

async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Session> {
    let session_id = SessionId::new(id);
    match state.registry.get_session(session_id.clone()).await {
        Some(session) => Ok(Json(session)),
        None => Err(RegistryError::SessionNotFound(session_id).into()),
    }
}

async fn update_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> ApiResult<Session> {
    let session = state
        .registry
        .update_session(SessionId::new(id), patch)
        .await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeRequest {
    terminal_id: String,
}

async fn resume_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<ResumeRequest>,
) -> ApiResult<Session> {
    let session = state
        .registry
        .request_resume(SessionId::new(id), request.terminal_id)
        .await?;
    Ok(Json(session))
}

async fn list_teams(State(state): State<ApiState>) -> Json<Vec<Team>> {
    Json(state.registry.get_teams().await)
}

#[derive(Debug, Default, Deserialize)]
struct ReplayQuery {
    #[serde(default)]
    since: u64,
}

#[derive(Debug, Serialize)]
struct ReplayResponse {
    entries: Vec<ReplayEntry>,
}

async fn replay_events(
    State(state): State<ApiState>,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<ReplayResponse> {
    match state.registry.replay_since(query.since).await? {
        Some(entries) => Ok(Json(ReplayResponse { entries })),
        None => Err(ApiError::new(
            StatusCode::GONE,
            format!(
                "events after {} are no longer buffered; reload sessions",
                query.since
            ),
        )),
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    hooks: StatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<QueueStats>,
}

async fn stats(State(state): State<ApiState>) -> ApiResult<StatsResponse> {
    let hooks = state.registry.stats().await?;
    Ok(Json(StatsResponse {
        hooks,
        queue: state.queue.as_ref().map(|c| c.snapshot()),
    }))
}

async fn list_terminals(State(state): State<ApiState>) -> Json<Vec<TerminalRecord>> {
    Json(state.terminals.list())
}

#[derive(Debug, Serialize)]
struct ProvisionResponse {
    terminal: TerminalRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    placeholder: Option<Session>,
}

async fn provision_terminal(
    State(state): State<ApiState>,
    Json(spec): Json<TerminalSpec>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    if spec.terminal_id.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "terminalId is required"));
    }

    let terminal = state.terminals.provision(&spec);
    let placeholder = if spec.placeholder {
        Some(
            state
                .registry
                .create_placeholder(spec.terminal_id.clone(), spec.cwd.clone())
                .await?,
        )
    } else {
        None
    };

    Ok((
        StatusCode::CREATED,
        Json(ProvisionResponse {
            terminal,
            placeholder,
        }),
    ))
}

async fn close_terminal(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let record = state.terminals.close(&id);
    let session_id = state.registry.terminal_closed(id.clone()).await?;

    if record.is_none() && session_id.is_none() {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("terminal not found: {id}"),
        ));
    }
    Ok(Json(json!({ "terminalId": id, "sessionId": session_id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::fake::FakeProbe;
    use crate::registry::{spawn_registry, RegistryConfig};

    fn state() -> ApiState {
        let probe = Arc::new(FakeProbe::new());
        let terminals = LocalTerminals::new(probe.clone());
        let registry = spawn_registry(
            RegistryConfig::default(),
            probe,
            Arc::new(terminals.clone()),
        );
        ApiState {
            registry,
            terminals,
            queue: None,
        }
    }

    #[tokio::test]
    async fn test_ingest_accepts_valid_hook() {
        let state = state();
        let body = json!({"session_id": "s1", "hook_event_name": "SessionStart", "cwd": "/repo"});

        let Json(reply) = ingest_hook(State(state.clone()), Ok(Json(body))).await.unwrap();
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["resolution"], "created");
        assert_eq!(state.registry.get_all_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_invalid_hook() {
        let state = state();
        let body = json!({"hook_event_name": "SessionStart"});

        let err = ingest_hook(State(state.clone()), Ok(Json(body))).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.message().contains("session_id"));
        assert!(state.registry.get_all_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let err = get_session(State(state()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resume_of_live_session_conflicts() {
        let state = state();
        ingest_hook(
            State(state.clone()),
            Ok(Json(json!({"session_id": "s1", "hook_event_name": "SessionStart"}))),
        )
        .await
        .unwrap();

        let err = resume_session(
            State(state),
            Path("s1".to_string()),
            Json(ResumeRequest {
                terminal_id: "t1".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_provision_and_close_terminal() {
        let state = state();
        let spec: TerminalSpec =
            serde_json::from_value(json!({"terminalId": "t1", "cwd": "/work"})).unwrap();

        let (status, Json(reply)) = provision_terminal(State(state.clone()), Json(spec))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let placeholder = reply.placeholder.unwrap();
        assert_eq!(placeholder.session_id.as_str(), "t1");

        let Json(closed) = close_terminal(State(state.clone()), Path("t1".to_string()))
            .await
            .unwrap();
        assert_eq!(closed["sessionId"], "t1");
        assert!(state.terminals.list().is_empty());

        let err = close_terminal(State(state), Path("t1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_replay_from_zero() {
        let state = state();
        ingest_hook(
            State(state.clone()),
            Ok(Json(json!({"session_id": "s1", "hook_event_name": "SessionStart"}))),
        )
        .await
        .unwrap();

        let Json(reply) = replay_events(State(state), Query(ReplayQuery { since: 0 }))
            .await
            .unwrap();
        assert_eq!(reply.entries.len(), 1);
        assert_eq!(reply.entries[0].seq, 1);
    }

    #[test]
    fn test_registry_error_status_mapping() {
        let err: ApiError = RegistryError::ChannelClosed.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        let err: ApiError = RegistryError::SessionNotFound(SessionId::new("x")).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
