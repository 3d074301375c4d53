//! Dispatch of decoded frames by message `type`.
//!
//! Routing is split in two: [`route`] decides what a frame produces (a direct
//! reply and/or a fan-out) and [`deliver`] queues it. The reply is always
//! queued before the fan-out, so a sender sees its own reply first.

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::server::{
    client::ConnectionId,
    codec::{decode_message, encode, reframe},
    message::{current_timestamp, ClientMessage, MessageError, ServerMessage},
    middleware::validate_message,
    ServerState,
};

/// Payload of a fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// An already-framed inbound message, forwarded as received.
    Raw(Bytes),
}

/// A message to deliver to every registered connection, optionally minus the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Fanout {
    pub payload: Outbound,
    pub include_sender: bool,
}

/// Everything one inbound frame produces.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dispatch {
    pub reply: Option<ServerMessage>,
    pub broadcast: Option<Fanout>,
}

impl Dispatch {
    fn reply(message: ServerMessage) -> Self {
        Self {
            reply: Some(message),
            broadcast: None,
        }
    }

    fn rejected(err: &MessageError) -> Self {
        Self::reply(ServerMessage::error(err))
    }
}

/// Parses one frame from `sender` and decides its effects.
///
/// Identity changes from `login` are applied to the registry here; nothing is
/// written to any socket.
pub fn route(segment: &[u8], sender: &ConnectionId, state: &ServerState) -> Dispatch {
    let label = state.clients.label(sender);

    let parsed = decode_message(segment)
        .and_then(ClientMessage::from_value)
        .and_then(|message| validate_message(&message).map(|_| message));

    let message = match parsed {
        Ok(message) => message,
        Err(e) => {
            warn!("[{}] rejected frame: {}", label, e);
            return Dispatch::rejected(&e);
        }
    };

    info!("[{}] -> {}", label, message.kind());

    match message {
        ClientMessage::Login { device_id } => {
            let device_id = device_id.unwrap_or_default();
            match state.clients.set_identity(sender, &device_id) {
                Ok(role) => {
                    info!("{} logged in as {} ({:?})", label, device_id, role);
                    Dispatch::reply(ServerMessage::LoginResponse {
                        success: true,
                        device_id,
                        message: "login successful".into(),
                    })
                }
                Err(e) => {
                    error!("Login for {} could not be recorded: {}", label, e);
                    Dispatch::default()
                }
            }
        }
        ClientMessage::Ping => Dispatch::reply(ServerMessage::Pong {
            timestamp: current_timestamp(),
        }),
        ClientMessage::Echo { data } => Dispatch::reply(ServerMessage::Echo {
            data,
            timestamp: current_timestamp(),
        }),
        ClientMessage::Command { data } => {
            debug!("[{}] command payload: {}", label, data);
            Dispatch::reply(ServerMessage::CommandResponse {
                data: Some(data),
                message: "command received".into(),
                timestamp: current_timestamp(),
            })
        }
        ClientMessage::SendParams { data } => {
            let timestamp = current_timestamp();
            let from = state.clients.get(sender).and_then(|c| c.identity);
            Dispatch {
                reply: Some(ServerMessage::CommandResponse {
                    data: None,
                    message: "params broadcast".into(),
                    timestamp,
                }),
                broadcast: Some(Fanout {
                    payload: Outbound::Message(ServerMessage::ParamsUpdate { from, data, timestamp }),
                    include_sender: true,
                }),
            }
        }
        ClientMessage::Broadcast => Dispatch {
            reply: None,
            broadcast: Some(Fanout {
                payload: Outbound::Raw(reframe(segment)),
                include_sender: state.config.broadcast_includes_sender,
            }),
        },
    }
}

/// Queues the reply to `sender`, then fans out the broadcast.
///
/// Per-target failures are logged and counted; they never stop delivery to
/// the remaining targets.
pub fn deliver(dispatch: Dispatch, sender: &ConnectionId, state: &ServerState) {
    let label = state.clients.label(sender);

    if let Some(reply) = dispatch.reply {
        match encode(&reply) {
            Ok(frame) => match state.clients.send_to(sender, frame) {
                Ok(()) => {
                    state.metrics.messages_sent.inc();
                    debug!("[{}] <- {}", label, reply.kind());
                }
                Err(e) => warn!("[{}] reply dropped: {}", label, e),
            },
            Err(e) => error!("Failed to encode {} reply: {}", reply.kind(), e),
        }
    }

    if let Some(fanout) = dispatch.broadcast {
        let (kind, frame) = match fanout.payload {
            Outbound::Message(message) => match encode(&message) {
                Ok(frame) => (message.kind(), frame),
                Err(e) => {
                    error!("Failed to encode {} broadcast: {}", message.kind(), e);
                    return;
                }
            },
            Outbound::Raw(frame) => ("broadcast", frame),
        };

        let exclude = if fanout.include_sender { None } else { Some(*sender) };
        let report = state.clients.broadcast(frame, exclude);
        state.metrics.messages_sent.inc_by(report.delivered as u64);
        state.metrics.broadcast_failures.inc_by(report.failed as u64);
        info!(
            "[{}] {} fanned out to {} connection(s), {} failed",
            label, kind, report.delivered, report.failed
        );
    }
}

/// Routes and delivers one inbound frame.
pub fn handle_frame(segment: &[u8], sender: &ConnectionId, state: &ServerState) {
    let dispatch = route(segment, sender, state);
    deliver(dispatch, sender, state);
}
