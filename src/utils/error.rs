use std::net::SocketAddr;
use thiserror::Error;

/// Represents the errors that can occur while running a room server.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The configured listen address is already held by another socket.
    ///
    /// This is fatal at startup; the supervising process decides whether to
    /// respawn on a different port.
    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    /// Binding the listener failed for a reason other than the address being taken.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Represents an error in the server configuration.
    ///
    /// This occurs when an invalid or inconsistent configuration is detected.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Represents a general connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A framing failure on a connection's byte stream.
    #[error("Codec error: {0}")]
    Codec(#[from] crate::server::codec::CodecError),

    /// Represents an error related to message handling.
    ///
    /// These are recoverable; the router turns them into `error` replies.
    #[error("Message error: {0}")]
    Message(#[from] crate::server::message::MessageError),

    /// Represents an error related to client registry operations.
    #[error("Client error: {0}")]
    Client(#[from] crate::server::client::ClientError),

    /// Raw socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Indicates a failure in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Implements conversion from `serde_json::Error` to `BrokerError`.
///
/// This allows serialization errors to be automatically converted into
/// `BrokerError::Serialization`.
impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        BrokerError::ConfigurationError(err.to_string())
    }
}
