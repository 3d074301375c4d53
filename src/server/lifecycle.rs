//! Listener lifecycle: `Starting -> Listening -> ShuttingDown -> Stopped`.

use serde::Serialize;
use std::{future::Future, io::ErrorKind, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, error, info};

use crate::{
    config::RoomServerConfig,
    server::{handler::handle_connection, ServerState},
    utils::error::BrokerError,
};

/// Where a room server is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Listening,
    ShuttingDown,
    Stopped,
}

/// The one machine-readable line printed to stdout once the socket is bound.
#[derive(Debug, Serialize)]
struct StartupStatus<'a> {
    status: &'static str,
    room_id: &'a str,
    room_name: &'a str,
    ip: &'a str,
    port: u16,
}

/// A bound, not yet serving, room server.
pub struct RoomServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    phase: watch::Sender<Phase>,
}

impl RoomServer {
    /// Validates `config` and binds the listening socket.
    ///
    /// # Errors
    /// `BrokerError::AddressInUse` if the port is taken; no fallback port is tried.
    pub async fn bind(config: RoomServerConfig) -> Result<Self, BrokerError> {
        let (phase, _) = watch::channel(Phase::Starting);
        config.validate()?;

        let addr = config.socket_addr()?;
        info!("Starting room {} ({}) on {}", config.room_id, config.room_name, addr);

        let listener = TcpListener::bind(addr).await.map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => BrokerError::AddressInUse(addr),
            _ => BrokerError::Bind { addr, source: e },
        })?;
        let local_addr = listener.local_addr()?;

        phase.send_replace(Phase::Listening);
        info!("Room server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(ServerState::new(config)),
            phase,
        })
    }

    /// The address actually bound (differs from the configured one for port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Watches phase transitions.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Renders the startup status JSON (without trailing newline).
    pub fn status_line(&self) -> Result<String, BrokerError> {
        let config = &self.state.config;
        let status = StartupStatus {
            status: "started",
            room_id: &config.room_id,
            room_name: &config.room_name,
            ip: &config.bind_address,
            port: self.local_addr.port(),
        };
        Ok(serde_json::to_string(&status)?)
    }

    /// Accepts connections until `shutdown` completes, then closes the listener.
    ///
    /// Open connections are not drained or notified.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), BrokerError>
    where
        F: Future<Output = ()>,
    {
        let RoomServer {
            listener,
            local_addr,
            state,
            phase,
        } = self;

        tokio::select! {
            _ = accept_connections(&listener, state.clone()) => {},
            _ = shutdown => {},
        }

        phase.send_replace(Phase::ShuttingDown);
        info!("Shutting down room server on {}", local_addr);
        drop(listener);

        debug!("Final metrics:\n{}", state.metrics.expose_metrics());
        phase.send_replace(Phase::Stopped);
        info!("Room server stopped ({} connection(s) left open)", state.clients.len());
        Ok(())
    }
}

/// Accepts connections and spawns a task for each.
///
/// Accept failures are logged and the loop keeps going.
async fn accept_connections(listener: &TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state_clone = state.clone();
                tokio::spawn(async move {
                    // Errors are already logged by the handler; the room carries on.
                    let _ = handle_connection(stream, addr, state_clone).await;
                });
            }
            Err(e) => error!("Accept error: {}", e),
        }
    }
}
