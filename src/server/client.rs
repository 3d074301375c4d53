use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{fmt, net::SocketAddr, sync::Arc, time::SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Identity string that marks a connection as the room's coordinator.
pub const COORDINATOR_IDENTITY: &str = "Server";

/// Transport handle key for a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a connection claimed to be at login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Not logged in yet.
    Unclaimed,
    /// Any identity other than the coordinator's.
    Device,
    /// Logged in as `"Server"`.
    Coordinator,
}

impl Role {
    pub fn for_identity(identity: &str) -> Self {
        if identity == COORDINATOR_IDENTITY {
            Role::Coordinator
        } else {
            Role::Device
        }
    }
}

/// Represents one accepted peer.
///
/// Outbound frames go through an unbounded channel to the connection's writer
/// task, so queuing never waits on the peer's socket.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    /// `host:port` of the peer.
    pub remote_addr: SocketAddr,
    /// Identity claimed via `login`; `None` until then.
    pub identity: Option<String>,
    pub role: Role,
    pub connected_at: SystemTime,
    sender: mpsc::UnboundedSender<Bytes>,
}

impl Connection {
    /// Creates a not-yet-logged-in connection that writes through `sender`.
    pub fn new(remote_addr: SocketAddr, sender: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            id: ConnectionId::new(),
            remote_addr,
            identity: None,
            role: Role::Unclaimed,
            connected_at: SystemTime::now(),
            sender,
        }
    }

    pub fn is_server_role(&self) -> bool {
        self.role == Role::Coordinator
    }

    /// Identity if logged in, otherwise the remote address.
    pub fn label(&self) -> String {
        match &self.identity {
            Some(identity) => identity.clone(),
            None => self.remote_addr.to_string(),
        }
    }

    /// Queues an encoded frame for the writer task.
    ///
    /// # Errors
    /// Returns `ClientError::SendFailed` once the writer task has gone away.
    pub fn send(&self, frame: Bytes) -> Result<(), ClientError> {
        self.sender
            .send(frame)
            .map_err(|_| ClientError::SendFailed(self.id))
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Registry of every open connection in the room.
///
/// The single source of truth for who is connected; a connection is present
/// exactly while its socket is open.
pub struct ClientManager {
    clients: Arc<DashMap<ConnectionId, Connection>>,
}

// Manual Clone implementation
impl Clone for ClientManager {
    fn clone(&self) -> Self {
        ClientManager {
            clients: Arc::clone(&self.clients),
        }
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
        }
    }

    /// Adds a freshly accepted connection.
    ///
    /// # Errors
    /// `ClientError::DuplicateRegistration` if the id is already present.
    pub fn register(&self, connection: Connection) -> Result<(), ClientError> {
        match self.clients.entry(connection.id) {
            Entry::Occupied(_) => Err(ClientError::DuplicateRegistration(connection.id)),
            Entry::Vacant(slot) => {
                debug!("Registered {} from {}", connection.id, connection.remote_addr);
                slot.insert(connection);
                Ok(())
            }
        }
    }

    /// Removes a connection. Absent ids are ignored, since the close and error
    /// paths may both get here.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Connection> {
        self.clients.remove(id).map(|(_, connection)| connection)
    }

    /// Records the identity a connection claimed at login and derives its role.
    ///
    /// Re-login overwrites. Identities are not unique across connections.
    pub fn set_identity(&self, id: &ConnectionId, identity: &str) -> Result<Role, ClientError> {
        let shared = self
            .clients
            .iter()
            .any(|entry| *entry.key() != *id && entry.value().identity.as_deref() == Some(identity));

        let mut connection = self.clients.get_mut(id).ok_or(ClientError::NotFound(*id))?;
        if shared {
            warn!("Identity {} is already claimed by another connection", identity);
        }
        connection.identity = Some(identity.to_string());
        connection.role = Role::for_identity(identity);
        Ok(connection.role)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Identity or remote address of a connection, for log lines.
    pub fn label(&self, id: &ConnectionId) -> String {
        self.clients
            .get(id)
            .map(|entry| entry.value().label())
            .unwrap_or_else(|| id.to_string())
    }

    /// Copies out every registered connection.
    ///
    /// Iterating the copy holds no registry locks, so connections may come and
    /// go while a broadcast walks it.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Queues a frame for a single connection.
    pub fn send_to(&self, id: &ConnectionId, frame: Bytes) -> Result<(), ClientError> {
        let connection = self.get(id).ok_or(ClientError::NotFound(*id))?;
        connection.send(frame)
    }

    /// Queues `frame` for every registered connection except `exclude`.
    ///
    /// A failed target is logged and counted; the rest still get the frame.
    /// Its removal is left to the connection's own task, which stops reading
    /// once its writer is gone.
    #[instrument(skip(self, frame), fields(bytes = frame.len()))]
    pub fn broadcast(&self, frame: Bytes, exclude: Option<ConnectionId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for connection in self.snapshot() {
            if Some(connection.id) == exclude {
                continue;
            }
            match connection.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Broadcast failed to {}: {}", connection.label(), e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Represents errors that may occur in registry operations.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Connection {0} is already registered")]
    DuplicateRegistration(ConnectionId),
    #[error("Connection {0} not found")]
    NotFound(ConnectionId),
    #[error("Failed to queue message for {0}")]
    SendFailed(ConnectionId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(port: u16) -> (Connection, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        (Connection::new(addr, tx), rx)
    }

    #[test]
    fn register_rejects_duplicates() {
        let clients = ClientManager::new();
        let (conn, _rx) = connection(5000);

        clients.register(conn.clone()).unwrap();
        assert!(matches!(
            clients.register(conn),
            Err(ClientError::DuplicateRegistration(_))
        ));
        assert_eq!(clients.len(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let clients = ClientManager::new();
        let (conn, _rx) = connection(5001);
        let id = conn.id;

        clients.register(conn).unwrap();
        assert!(clients.unregister(&id).is_some());
        assert!(clients.unregister(&id).is_none());
        assert!(clients.is_empty());
        assert!(clients.snapshot().is_empty());
    }

    #[test]
    fn identity_sets_role_and_label() {
        let clients = ClientManager::new();
        let (conn, _rx) = connection(5002);
        let id = conn.id;
        clients.register(conn).unwrap();

        assert_eq!(clients.label(&id), "127.0.0.1:5002");
        assert_eq!(clients.get(&id).unwrap().role, Role::Unclaimed);

        assert_eq!(clients.set_identity(&id, "device-7").unwrap(), Role::Device);
        assert_eq!(clients.label(&id), "device-7");
        assert!(!clients.get(&id).unwrap().is_server_role());

        assert_eq!(clients.set_identity(&id, "Server").unwrap(), Role::Coordinator);
        assert!(clients.get(&id).unwrap().is_server_role());
    }

    #[test]
    fn shared_identity_is_accepted() {
        let clients = ClientManager::new();
        let (a, _rx_a) = connection(5003);
        let (b, _rx_b) = connection(5004);
        let (id_a, id_b) = (a.id, b.id);
        clients.register(a).unwrap();
        clients.register(b).unwrap();

        clients.set_identity(&id_a, "tablet").unwrap();
        clients.set_identity(&id_b, "tablet").unwrap();
        assert_eq!(clients.label(&id_a), clients.label(&id_b));
    }

    #[test]
    fn set_identity_on_unknown_connection() {
        let clients = ClientManager::new();
        assert!(matches!(
            clients.set_identity(&ConnectionId::new(), "x"),
            Err(ClientError::NotFound(_))
        ));
    }

    #[test]
    fn broadcast_skips_excluded_and_survives_dead_targets() {
        let clients = ClientManager::new();
        let (a, mut rx_a) = connection(5005);
        let (b, rx_b) = connection(5006);
        let (c, mut rx_c) = connection(5007);
        let (id_a, id_b) = (a.id, b.id);
        clients.register(a).unwrap();
        clients.register(b).unwrap();
        clients.register(c).unwrap();

        // b's writer is gone.
        drop(rx_b);

        let report = clients.broadcast(Bytes::from_static(b"hi\n"), Some(id_a));
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_c.try_recv().unwrap(), Bytes::from_static(b"hi\n"));
        // Removal belongs to b's connection task, not to whoever broadcast.
        assert!(clients.get(&id_b).is_some());
        assert_eq!(clients.len(), 3);
    }
}
