//! Application State

use std::sync::Arc;
use std::time::Duration;

use agent_core::{Agent, McpBridge, SessionStore};
use agent_runtime::SessionArchive;
use tokio::task::JoinHandle;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Agent serving every session
    pub agent: Arc<Agent>,

    /// Session persistence (None if not configured)
    pub archive: Option<SessionArchive>,

    /// Connected MCP servers
    pub bridge: Arc<McpBridge>,
}

impl AppState {
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        self.agent.sessions()
    }
}

/// Periodically drop sessions idle for longer than `idle_timeout`
pub fn spawn_sweeper(
    sessions: Arc<dyn SessionStore>,
    idle_timeout: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = sessions.sweep_stale(idle_timeout);
            if removed > 0 {
                tracing::info!(removed, remaining = sessions.len(), "Swept stale sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use agent_core::{MemorySessionStore, SessionId};

    use super::*;

    #[tokio::test]
    async fn test_sweeper_removes_idle_sessions() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        store.get_or_create(&SessionId::from("idle"));

        let sweeper = spawn_sweeper(
            Arc::clone(&store),
            Duration::from_millis(5),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        sweeper.abort();

        assert!(store.is_empty());
    }
}
