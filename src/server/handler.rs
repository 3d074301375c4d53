use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    server::{
        client::Connection,
        codec::{encode, CodecError, FrameCodec},
        message::ServerMessage,
        router, ServerState,
    },
    utils::error::BrokerError,
};

/// Drains a connection's outbound queue into its socket.
///
/// Ends when every sender is dropped (the connection was unregistered) or on
/// the first write error.
async fn write_frames<W>(
    writer: W,
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
    addr: SocketAddr,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, BytesCodec::new());
    while let Some(frame) = receiver.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!("Write to {} failed: {}", addr, e);
            return Err(e);
        }
    }
    debug!("Writer for {} finished", addr);
    Ok(())
}

/// Runs one accepted connection until the peer closes it or the socket fails.
///
/// The welcome is the first frame the peer receives, and the connection is
/// unregistered on every exit path after registration. Protocol errors in
/// individual frames are answered in-band and never end the connection; only
/// socket errors and oversized frames do.
///
/// # Errors
/// Returns `BrokerError` for socket or framing failures. These are
/// per-connection and never affect other peers.
#[instrument(skip(stream, state))]
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), BrokerError> {
    let (reader, writer) = stream.into_split();
    run_connection(reader, writer, addr, state).await
}

async fn run_connection<R, W>(
    reader: R,
    writer: W,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), BrokerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    let mut write_task = tokio::spawn(write_frames(writer, receiver, addr));

    let connection = Connection::new(addr, sender);
    let id = connection.id;

    // Queued ahead of registration so no broadcast can overtake it.
    let welcome = ServerMessage::welcome(&state.config.room_id, &state.config.room_name);
    connection.send(encode(&welcome)?)?;
    state.metrics.messages_sent.inc();

    state.clients.register(connection)?;
    state.metrics.connections.inc();
    info!("Client connected: {} ({} online)", addr, state.clients.len());

    let mut frames = FramedRead::new(reader, FrameCodec::new(state.config.max_frame_length));

    let process_result = async {
        loop {
            let frame = tokio::select! {
                biased;
                // The registry still holds a sender, so the writer only ends on failure.
                written = &mut write_task => {
                    let reason = match written {
                        Ok(Err(e)) => e.to_string(),
                        Ok(Ok(())) => "writer closed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    return Err(BrokerError::Connection(format!(
                        "write to {} failed: {}",
                        addr, reason
                    )));
                }
                frame = frames.next() => frame,
            };

            match frame {
                None => return Ok(()),
                Some(Ok(segment)) => {
                    state.metrics.messages_received.inc();
                    router::handle_frame(&segment, &id, &state);
                }
                Some(Err(CodecError::FrameTooLong { max })) => {
                    let reply = ServerMessage::Error {
                        message: "frame too long".into(),
                    };
                    if let Ok(frame) = encode(&reply) {
                        let _ = state.clients.send_to(&id, frame);
                    }
                    return Err(BrokerError::Connection(format!(
                        "{} sent a frame over {} bytes",
                        addr, max
                    )));
                }
                Some(Err(e)) => return Err(BrokerError::from(e)),
            }
        }
    }
    .await;

    let label = state.clients.label(&id);
    state.clients.unregister(&id);
    state.metrics.connections.dec();

    match &process_result {
        Ok(()) => info!("Client disconnected: {} ({} online)", label, state.clients.len()),
        Err(e) => error!("Client {} dropped: {}", label, e),
    }

    process_result
}
