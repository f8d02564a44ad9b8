//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use voxloop_core::config::Config;
use voxloop_pipeline::{EventSink, Orchestrator};

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: SessionRegistry,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
            registry: SessionRegistry::new(),
        }
    }
}

/// Live sessions, keyed by connection id. Owned by the gateway and passed
/// by reference where needed; sessions themselves live in their
/// connection tasks.
pub struct SessionRegistry {
    entries: RwLock<HashMap<String, SessionEntry>>,
}

/// Registry view of one connected session.
pub struct SessionEntry {
    pub session_id: String,
    pub event_tx: EventSink,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, conn_id: String, entry: SessionEntry) {
        self.entries.write().await.insert(conn_id, entry);
    }

    pub async fn remove(&self, conn_id: &str) {
        self.entries.write().await.remove(conn_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
