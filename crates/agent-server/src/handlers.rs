//! HTTP/WebSocket Handlers

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use agent_core::{
    message::Message as ChatMessage,
    provider::ModelInfo,
    registry::ToolOrigin,
    session::{SessionMetadata, SessionSummary},
    store::{SessionGuard, SessionHandle},
    AgentError, ChatOutcome, CreateSession, DangerClass, SessionId,
};

use crate::state::AppState;

const EXHAUSTED_MESSAGE: &str =
    "I wasn't able to finish this request within the allowed number of steps. Please try rephrasing or narrowing it down.";

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider_connected: bool,
    pub tools: usize,
    pub mcp_servers: Vec<String>,
    pub sessions: usize,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub message: String,
    /// `answered` or `exhausted`
    pub status: &'static str,
    pub iterations: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    #[serde(skip_serializing_if = "SessionMetadata::is_empty")]
    pub metadata: SessionMetadata,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub danger: DangerClass,
    pub origin: ToolOrigin,
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    pub session_id: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error returned by every fallible handler
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                code: code.into(),
            },
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        let (status, code) = match &e {
            AgentError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            AgentError::SessionExists(_) => (StatusCode::CONFLICT, "SESSION_EXISTS"),
            AgentError::Config(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            AgentError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            AgentError::ProviderUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "PROVIDER_UNAVAILABLE"),
            AgentError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            AgentError::Auth(_) | AgentError::Provider(_) | AgentError::NoUsableResponse { .. } => {
                (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR"),
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "Request failed");
        }
        Self::new(status, code, e.user_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn session_not_found(id: &str) -> ApiError {
    AgentError::SessionNotFound(id.to_string()).into()
}

/// Lock a session without waiting behind an in-flight chat
fn lock_idle(handle: &SessionHandle) -> Result<SessionGuard, ApiError> {
    handle.try_lock().ok_or_else(|| {
        ApiError::new(
            StatusCode::CONFLICT,
            "SESSION_BUSY",
            format!("Session '{}' is handling a chat; retry once it finishes", handle.id()),
        )
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider_connected = state.agent.provider().health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        provider_connected,
        tools: state.agent.tools().len(),
        mcp_servers: state.bridge.server_names().into_iter().map(String::from).collect(),
        sessions: state.sessions().len(),
    })
}

pub async fn list_models(State(state): State<AppState>) -> ApiResult<Vec<ModelInfo>> {
    Ok(Json(state.agent.provider().list_models().await?))
}

pub async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolInfo>> {
    let registry = state.agent.tools();
    let tools = registry
        .names()
        .into_iter()
        .filter_map(|name| registry.lookup(&name))
        .map(|entry| ToolInfo {
            name: entry.schema().name.clone(),
            description: entry.schema().description.clone(),
            danger: entry.danger(),
            origin: entry.origin().clone(),
        })
        .collect();
    Json(tools)
}

pub async fn create_session(
    State(state): State<AppState>,
    payload: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<SessionSummary>), ApiError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();

    let mut options = CreateSession::new().metadata(SessionMetadata {
        title: payload.title,
        system_prompt: payload.system_prompt,
        ..SessionMetadata::default()
    });
    if let Some(id) = payload.session_id {
        options = options.id(id);
    }

    let handle = state.sessions().create(options)?;
    Ok((StatusCode::CREATED, Json(handle.summary())))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions().list())
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionDetail> {
    let handle = state
        .sessions()
        .get(&SessionId::from(id.as_str()))
        .ok_or_else(|| session_not_found(&id))?;

    let session = lock_idle(&handle)?;
    Ok(Json(SessionDetail {
        summary: session.summary(),
        metadata: session.metadata.clone(),
        messages: session.messages().to_vec(),
    }))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.sessions().destroy(&SessionId::from(id.as_str())) {
        return Err(session_not_found(&id));
    }
    if let Some(archive) = &state.archive {
        archive.remove(&id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionSummary> {
    let handle = state
        .sessions()
        .get(&SessionId::from(id.as_str()))
        .ok_or_else(|| session_not_found(&id))?;

    let mut session = lock_idle(&handle)?;
    session.clear();
    Ok(Json(session.summary()))
}

pub async fn save_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SaveResponse> {
    let archive = state.archive.as_ref().ok_or_else(|| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "PERSISTENCE_DISABLED",
            "Session persistence is not configured",
        )
    })?;
    let handle = state
        .sessions()
        .get(&SessionId::from(id.as_str()))
        .ok_or_else(|| session_not_found(&id))?;

    let record = lock_idle(&handle)?.to_record();
    let path = archive.save(&record).await?;
    Ok(Json(SaveResponse {
        session_id: id,
        path: path.display().to_string(),
    }))
}

/// Main chat endpoint
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    if payload.message.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "EMPTY_MESSAGE", "Message must not be empty"));
    }

    let session_id = payload
        .session_id
        .map_or_else(SessionId::new, SessionId::from_string);

    let outcome = state.agent.chat(&session_id, &payload.message).await?;

    let response = match outcome {
        ChatOutcome::Answer { text, iterations } => ChatResponse {
            session_id: session_id.to_string(),
            message: text,
            status: "answered",
            iterations,
        },
        ChatOutcome::Exhausted { iterations } => ChatResponse {
            session_id: session_id.to_string(),
            message: EXHAUSTED_MESSAGE.into(),
            status: "exhausted",
            iterations,
        },
    };
    Ok(Json(response))
}

/// WebSocket feed of agent events for one session
pub async fn session_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state, id))
}

async fn stream_events(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.agent.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.session_id() == session_id => {
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(session_id = %session_id, skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
