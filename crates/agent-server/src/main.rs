//! Agent HTTP Server
//!
//! Axum-based server fielding many concurrent, session-scoped conversations
//! with a shared tool-calling agent. Tools come from the built-in set plus
//! any MCP servers listed in `MCP_CONFIG`.

mod config;
mod handlers;
mod state;
mod tools;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{
    Agent, BridgeConfig, DangerPolicy, LlmProvider, McpBridge, MemorySessionStore, SessionStore,
    ToolRegistry,
};
use agent_runtime::{OllamaProvider, SessionArchive, StdioConnector};

use crate::config::ServerConfig;
use crate::handlers::{
    chat_handler, clear_session, create_session, delete_session, get_session, health_check,
    list_models, list_sessions, list_tools, save_session, session_events,
};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    // Initialize LLM provider
    let provider = Arc::new(OllamaProvider::from_env());

    // Verify Ollama connection
    match provider.health_check().await {
        Ok(true) => {
            tracing::info!(url = provider.base_url(), "Connected to Ollama");
            if let Ok(models) = provider.list_models().await {
                for model in models {
                    tracing::info!("  Model: {}", model.id);
                }
            }
        }
        Ok(false) | Err(_) => {
            tracing::warn!("Ollama not available - chats will fail until it is reachable");
            tracing::warn!("  Make sure Ollama is running: ollama serve");
        }
    }

    // Initialize tools
    let policy = config
        .dangerous_tools
        .iter()
        .fold(DangerPolicy::conventional(), |policy, name| policy.with_name(name));
    let tools = Arc::new(ToolRegistry::with_policy(policy));
    tools::register_builtin(&tools);

    let bridge = match &config.mcp_config {
        Some(path) => {
            let bridge_config = BridgeConfig::load(path)?;
            McpBridge::connect(&bridge_config, &StdioConnector).await
        }
        None => McpBridge::default(),
    };
    let bridged = tools.merge_bridge(&bridge);

    tracing::info!(bridged, "Registered {} tools:", tools.len());
    for name in tools.names() {
        tracing::info!("  • {}", name);
    }

    // Sessions, restored from the archive when persistence is on
    let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let archive = config.archive_dir.clone().map(SessionArchive::new);
    if let Some(archive) = &archive {
        let restored = archive.restore_into(sessions.as_ref()).await?;
        tracing::info!(restored, dir = %archive.dir().display(), "Session archive loaded");
    }

    let agent = Agent::builder()
        .provider(provider)
        .tools(tools)
        .sessions(Arc::clone(&sessions))
        .approval_policy(config.approval)
        .model(config.model.clone())
        .max_iterations(config.max_iterations)
        .build()?;
    tracing::info!(approval = ?config.approval, model = %config.model, "Agent ready");

    let sweeper = state::spawn_sweeper(sessions, config.idle_timeout, config.sweep_interval);

    let state = AppState {
        agent: Arc::new(agent),
        archive,
        bridge: Arc::new(bridge),
    };
    let app = router(state.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("Agent server running on http://{}", config.bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET    /health                    - Health check");
    tracing::info!("  GET    /api/models                - List available models");
    tracing::info!("  GET    /api/tools                 - List registered tools");
    tracing::info!("  POST   /api/chat                  - Send message");
    tracing::info!("  GET    /api/sessions              - List sessions");
    tracing::info!("  POST   /api/sessions              - Create session");
    tracing::info!("  GET    /api/sessions/{{id}}         - Session history");
    tracing::info!("  DELETE /api/sessions/{{id}}         - Delete session");
    tracing::info!("  POST   /api/sessions/{{id}}/clear   - Clear history");
    tracing::info!("  POST   /api/sessions/{{id}}/save    - Save to archive");
    tracing::info!("  GET    /api/sessions/{{id}}/events  - WebSocket event feed");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    state.bridge.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

fn router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/tools", get(list_tools))
        // Agent API
        .route("/api/chat", post(chat_handler))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/clear", post(clear_session))
        .route("/api/sessions/{id}/save", post(save_session))
        .route("/api/sessions/{id}/events", get(session_events))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
