// src/server/mod.rs
pub mod client;
pub mod codec;
pub mod handler;
pub mod health;
pub mod lifecycle;
pub mod message;
pub mod middleware;
pub mod router;
pub mod signals;

// Re-export public components
pub use client::{ClientManager, Connection, ConnectionId, Role};
pub use handler::handle_connection;
pub use health::HealthMetrics;
pub use message::{ClientMessage, ServerMessage};

use std::sync::Arc;
use crate::config::RoomServerConfig;

/// State shared by every connection task of one room.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<RoomServerConfig>,
    pub clients: ClientManager,
    pub metrics: HealthMetrics,
}

impl ServerState {
    pub fn new(config: RoomServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            clients: ClientManager::new(),
            metrics: HealthMetrics::new(),
        }
    }
}
