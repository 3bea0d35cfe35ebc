use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use tracing::info;

use crate::AppState;
use crate::config::AppConfig;
use crate::error::ChatError;
use crate::llm::{ChatCompletionsDriver, LlmDriver};
use crate::mcp::config::load_mcp_config;
use crate::mcp::native::LocalToolProvider;
use crate::mcp::provider::{ToolProvider, connect_all};
use crate::mcp::registry::{RegistryGate, ToolRegistry};
use crate::protocol::FrameSink;
use crate::session::{ChatService, SessionDirectory, SqliteSessionDirectory};

/// Frames buffered between a running turn and the socket.
const FRAME_BUFFER: usize = 64;

/// Name used when a session is created without one.
const NEW_SESSION_NAME: &str = "New session";

/// Open the session store and wire the service together.
///
/// Tool providers are connected lazily, on the first request that needs
/// the catalogue.
pub async fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let settings = config.llm_settings();
    if settings.api_key.is_none() {
        tracing::warn!("No LLM API key configured; requests are sent unauthenticated");
    }
    info!(
        name: "llm.config.loaded",
        api_url = %settings.api_url,
        model = %settings.model,
        "LLM configuration loaded"
    );

    let directory: Arc<dyn SessionDirectory> =
        Arc::new(SqliteSessionDirectory::connect(&config.storage.database_url).await?);
    let driver: Arc<dyn LlmDriver> = Arc::new(ChatCompletionsDriver::new(settings));
    let gate = Arc::new(registry_gate(&config));

    let service =
        ChatService::start(directory, driver, gate, config.orchestrator_settings()).await?;

    Ok(AppState {
        service: Arc::new(service),
        config: Arc::new(config),
    })
}

/// Gate that builds the registry from the local provider plus the
/// configured MCP servers.
#[must_use]
pub fn registry_gate(config: &AppConfig) -> RegistryGate {
    let local_name = config.tools.local_provider.clone();
    let servers_file = config.tools.servers_file.clone();
    let search_url = config.search_url();
    let system_prompt = config.llm.system_prompt.clone();
    let call_timeout = config.call_timeout();

    RegistryGate::new(move || {
        let local_name = local_name.clone();
        let servers_file = servers_file.clone();
        let search_url = search_url.clone();
        let system_prompt = system_prompt.clone();
        Box::pin(async move {
            let mut local = LocalToolProvider::standard(local_name.as_str(), search_url)
                .map_err(|e| ChatError::Config(format!("local tools: {e:#}")))?;
            if let Some(prompt) = system_prompt {
                local = local.with_system_prompt(prompt);
            }
            let mcp = load_mcp_config(&servers_file)
                .map_err(|e| ChatError::Config(format!("{servers_file}: {e:#}")))?;

            let mut providers: Vec<Arc<dyn ToolProvider>> = vec![Arc::new(local)];
            providers.extend(connect_all(&mcp.mcp_servers, &local_name).await);

            let registry = ToolRegistry::build(&local_name, providers, call_timeout).await;
            for tool in registry.catalogue() {
                info!(name: "mcp.tool.discovered", tool = %tool.qualified_name, "Tool discovered");
            }
            Ok(registry)
        })
    })
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ws", get(ws_handler))
        .route("/api/clear", post(api_clear))
        .route("/api/tools", get(api_tools))
        .route("/api/sessions", get(api_list_sessions).post(api_create_session))
        .route("/api/sessions/active", get(api_active_session))
        .route(
            "/api/sessions/{id}",
            axum::routing::put(api_rename_session).delete(api_delete_session),
        )
        .route("/api/sessions/{id}/switch", post(api_switch_session))
        .route("/api/sessions/{id}/messages", get(api_get_messages))
        .fallback_service(ServeDir::new("static"))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Axum server and run until Ctrl-C.
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::SessionDeleteRefused => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            Json(json!({ "status": "error", "message": self.to_string() })),
        )
            .into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// One chat message sent by the client over the socket.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    session_id: Option<i64>,
}

/// GET /api/ws - Chat over a WebSocket.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    info!("WebSocket connected");

    while let Some(incoming) = receiver.next().await {
        let text = match incoming {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket receive failed");
                break;
            }
        };

        let request = match serde_json::from_str::<ChatRequest>(text.as_str()) {
            Ok(req) if !req.message.trim().is_empty() => req,
            Ok(_) => {
                let frame = json!({ "error": "message must not be empty" }).to_string();
                if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                let frame = json!({ "error": format!("invalid request: {e}") }).to_string();
                if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let (sink, mut frames) = FrameSink::channel(FRAME_BUFFER);
        let service = Arc::clone(&state.service);
        let turn = tokio::spawn(async move {
            service
                .send_message(request.session_id, &request.message, &sink)
                .await
        });

        let mut client_gone = false;
        while let Some(frame) = frames.recv().await {
            if sender.send(WsMessage::Text(frame.into_wire().into())).await.is_err() {
                client_gone = true;
                break;
            }
        }
        // A closed receiver makes the turn stop at its next frame.
        drop(frames);

        match turn.await {
            Ok(Ok(outcome)) => tracing::debug!(?outcome, "Turn finished"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Turn failed"),
            Err(e) => tracing::error!(error = %e, "Turn task panicked"),
        }

        if client_gone {
            break;
        }
    }

    info!("WebSocket disconnected");
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/clear - Clear the active session's history.
async fn api_clear(State(state): State<AppState>) -> Result<impl IntoResponse, ChatError> {
    state.service.clear(None).await?;
    Ok(Json(json!({ "status": "success" })))
}

/// GET /api/tools - Tools grouped by provider.
async fn api_tools(State(state): State<AppState>) -> Result<impl IntoResponse, ChatError> {
    let registry = state.service.tools().await?;
    Ok(Json(json!({
        "status": "success",
        "tools_by_server": registry.tools_by_server(),
    })))
}

#[derive(Debug, Deserialize)]
struct SessionName {
    #[serde(default)]
    name: String,
}

/// GET /api/sessions - All sessions, most recent first.
async fn api_list_sessions(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ChatError> {
    let sessions = state.service.list_sessions().await?;
    let active = state.service.active_session().await;
    Ok(Json(json!({
        "status": "success",
        "active_session_id": active,
        "sessions": sessions,
    })))
}

/// POST /api/sessions - Create a session and make it active.
async fn api_create_session(
    State(state): State<AppState>,
    Json(body): Json<SessionName>,
) -> Result<impl IntoResponse, ChatError> {
    let name = match body.name.trim() {
        "" => NEW_SESSION_NAME,
        name => name,
    };
    let id = state.service.create_session(name).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "session_id": id })),
    ))
}

/// PUT /api/sessions/{id} - Rename a session.
async fn api_rename_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<SessionName>,
) -> Result<impl IntoResponse, ChatError> {
    state.service.rename_session(id, body.name.trim()).await?;
    Ok(Json(json!({ "status": "success" })))
}

/// DELETE /api/sessions/{id} - Delete a session (never the last one).
async fn api_delete_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    state.service.delete_session(id).await?;
    let active = state.service.active_session().await;
    Ok(Json(json!({ "status": "success", "active_session_id": active })))
}

/// POST /api/sessions/{id}/switch - Make a session active.
async fn api_switch_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    let messages = state.service.switch_session(id).await?;
    Ok(Json(json!({
        "status": "success",
        "session_id": id,
        "messages": messages,
    })))
}

/// GET /api/sessions/{id}/messages - Session history.
async fn api_get_messages(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    let messages = state.service.messages(id).await?;
    Ok(Json(json!({ "status": "success", "messages": messages })))
}

/// GET /api/sessions/active - Id of the active session.
async fn api_active_session(State(state): State<AppState>) -> impl IntoResponse {
    let id = state.service.active_session().await;
    Json(json!({ "status": "success", "session_id": id }))
}
