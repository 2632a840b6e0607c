//! Per-connection protocol handling.
//!
//! Each accepted socket gets a read loop on the connection task and a
//! writer task draining the hub-fed outbound queue, so a stalled peer
//! never blocks message handling. The connection's role is fixed by which
//! listener accepted it; an opcode outside the role's whitelist, or a
//! subscribe to a slot index the pool does not have, closes the
//! connection.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, ProtocolError, Result};
use crate::hub::{ConnectionId, Hub, OutboundItem, OutboundQueue};
use crate::protocol::codec;
use crate::protocol::{ConnectionRole, Decoder, ErrorCode, Message};
use crate::server::config::ServerConfig;
use crate::server::control::ControlHandle;

pub(crate) struct Connection<S> {
    id: ConnectionId,
    role: ConnectionRole,
    peer: String,
    stream: S,
    config: ServerConfig,
    hub: Arc<Hub>,
    control: ControlHandle,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        id: ConnectionId,
        role: ConnectionRole,
        peer: String,
        stream: S,
        config: ServerConfig,
        hub: Arc<Hub>,
        control: ControlHandle,
    ) -> Self {
        Self {
            id,
            role,
            peer,
            stream,
            config,
            hub,
            control,
        }
    }

    pub(crate) async fn run(self) -> Result<()> {
        let Connection {
            id,
            role,
            peer,
            stream,
            config,
            hub,
            control,
        } = self;

        let queue = hub.register_connection(id, peer.clone()).await;
        debug!(conn = %id, peer = %peer, role = %role, "Connection registered");

        let (reader, writer) = tokio::io::split(stream);
        let mut writer_task = tokio::spawn(write_loop(writer, Arc::clone(&queue)));

        let mut handler = MessageHandler {
            id,
            role,
            hub: Arc::clone(&hub),
            control,
            queue: Arc::clone(&queue),
        };
        let decoder = Decoder::with_max_frame_len(config.max_frame_len);
        let result = read_loop(reader, decoder, config.read_buffer_size, &mut handler).await;

        // Let the writer flush what is already queued, then cut it loose.
        queue.close();
        if tokio::time::timeout(config.drain_timeout, &mut writer_task)
            .await
            .is_err()
        {
            writer_task.abort();
        }
        hub.connection_closed(id).await;
        result
    }
}

async fn read_loop<R>(
    mut reader: R,
    decoder: Decoder,
    buffer_size: usize,
    handler: &mut MessageHandler,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        while let Some(msg) = decoder.decode(&mut buf)? {
            let op = msg.opcode();
            if !handler.role.permits(op) {
                warn!(conn = %handler.id, role = %handler.role, opcode = op, "Forbidden opcode");
                return Err(ProtocolError::Forbidden {
                    opcode: op,
                    role: handler.role,
                }
                .into());
            }
            handler.handle(msg).await?;
        }
        if reader.read_buf(&mut buf).await? == 0 {
            debug!(conn = %handler.id, "Peer closed connection");
            return Ok(());
        }
    }
}

async fn write_loop<W>(mut writer: W, queue: Arc<OutboundQueue>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    while let Some(item) = queue.pop().await {
        buf.clear();
        match &item {
            OutboundItem::Frame(frame) => {
                codec::encode(&Message::Frame(frame.to_message()), &mut buf)
            }
            OutboundItem::Control(msg) => codec::encode(msg, &mut buf),
        }
        writer.write_all(&buf).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

struct MessageHandler {
    id: ConnectionId,
    role: ConnectionRole,
    hub: Arc<Hub>,
    control: ControlHandle,
    queue: Arc<OutboundQueue>,
}

impl MessageHandler {
    async fn handle(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Subscribe { slot } => {
                let outcome = self.hub.subscribe(self.id, slot).await?;
                self.queue.push_control(Message::SubscribeAck { slot });
                if let Some(frame) = outcome.catch_up {
                    debug!(conn = %self.id, slot, sequence = frame.sequence, "Sending catch-up keyframe");
                    self.queue.push_frame(frame);
                }
                if outcome.newly_added {
                    // The catch-up keyframe alone is not enough on a busy
                    // slot; deltas after it still chain off frames this
                    // viewer never saw.
                    self.control.request_keyframe(slot);
                }
            }
            Message::Unsubscribe { slot } => {
                self.hub.unsubscribe(self.id, slot).await?;
            }
            Message::EnableSlot {
                slot,
                width,
                height,
            } => match self.control.enable_slot(slot, width, height).await {
                Ok(generation) => {
                    debug!(conn = %self.id, slot, generation, "Slot enabled via control plane");
                    self.queue.push_control(Message::EnableAck { slot });
                }
                Err(err) => {
                    warn!(conn = %self.id, slot, error = %err, "Enable failed");
                    self.queue.push_control(Message::EnableErr {
                        slot,
                        code: error_code_for(&err),
                    });
                }
            },
            Message::DisableSlot { slot } => {
                // Fire and forget on the wire; failures are logged only.
                if let Err(err) = self.control.disable_slot(slot).await {
                    warn!(conn = %self.id, slot, error = %err, "Disable failed");
                }
            }
            Message::Ping { token } => {
                self.queue.push_control(Message::Pong { token });
            }
            Message::Pong { .. } => {}
            // Server-to-peer opcodes never get here; the role check
            // rejected them.
            _ => {}
        }
        Ok(())
    }
}

fn error_code_for(err: &Error) -> ErrorCode {
    match err {
        Error::Protocol(ProtocolError::SlotOutOfRange { .. }) => ErrorCode::InvalidSlot,
        Error::Encoder(_) => ErrorCode::EncoderUnavailable,
        _ => ErrorCode::Internal,
    }
}
