use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Represents the per-message protocol errors.
///
/// Each variant's display text is exactly what the peer receives in the
/// `message` field of an `error` reply. None of them close the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The frame is not valid JSON.
    #[error("invalid JSON")]
    Malformed,

    /// The frame is JSON but has no string `type` field.
    #[error("missing type")]
    MissingType,

    /// The `type` field names no known message.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A known message type whose fields have the wrong shape.
    #[error("invalid {kind} message: {reason}")]
    InvalidFields { kind: String, reason: String },

    /// A `login` without a usable `device_id`.
    #[error("missing device_id")]
    MissingDeviceId,
}

/// Represents the messages a peer can send to the room.
///
/// Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Claims an identity for the sending connection.
    Login {
        #[serde(default, deserialize_with = "device_id_text")]
        device_id: Option<String>,
    },

    /// Liveness probe.
    Ping,

    /// Asks the server to send `data` straight back.
    Echo {
        #[serde(default)]
        data: Value,
    },

    /// A command addressed to the server; acknowledged, not interpreted.
    Command {
        #[serde(default)]
        data: Value,
    },

    /// Parameters to push to every peer in the room, sender included.
    SendParams {
        #[serde(default)]
        data: Value,
    },

    /// Forwarded verbatim to the other peers.
    Broadcast,
}

impl ClientMessage {
    /// Every `type` tag the router understands.
    pub const KINDS: [&'static str; 6] = ["login", "ping", "echo", "command", "send_params", "broadcast"];

    /// Builds a typed message from an already-parsed JSON value.
    ///
    /// # Errors
    /// `MissingType` if `type` is absent or not a string, `UnknownType` for an
    /// unrecognised tag, `InvalidFields` if a known type has ill-typed fields.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(MessageError::MissingType),
        };

        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(MessageError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| MessageError::InvalidFields {
            kind,
            reason: e.to_string(),
        })
    }

    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Login { .. } => "login",
            ClientMessage::Ping => "ping",
            ClientMessage::Echo { .. } => "echo",
            ClientMessage::Command { .. } => "command",
            ClientMessage::SendParams { .. } => "send_params",
            ClientMessage::Broadcast => "broadcast",
        }
    }
}

/// Reads a `device_id` given as a string or a number; numbers keep their JSON text.
fn device_id_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "device_id must be a string or number, got {}",
            other
        ))),
    }
}

/// Represents messages that the server sends to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every accepted connection.
    Welcome {
        room_id: String,
        room_name: String,
        message: String,
    },

    LoginResponse {
        success: bool,
        device_id: String,
        message: String,
    },

    Pong {
        timestamp: u64,
    },

    Echo {
        data: Value,
        timestamp: u64,
    },

    CommandResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        message: String,
        timestamp: u64,
    },

    /// Fan-out of a `send_params`; `from` is null when the sender never logged in.
    ParamsUpdate {
        from: Option<String>,
        data: Value,
        timestamp: u64,
    },

    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn welcome(room_id: &str, room_name: &str) -> Self {
        ServerMessage::Welcome {
            room_id: room_id.to_string(),
            room_name: room_name.to_string(),
            message: format!("Welcome to room {}", room_name),
        }
    }

    pub fn error(err: &MessageError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::LoginResponse { .. } => "login_response",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Echo { .. } => "echo",
            ServerMessage::CommandResponse { .. } => "command_response",
            ServerMessage::ParamsUpdate { .. } => "params_update",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
