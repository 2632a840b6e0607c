//! Frame subscriber client
//!
//! High-level API for pulling encoded frame streams from a scanout
//! stream server's viewer endpoint.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{codec, Decoder, FrameMessage, Message};

use super::config::ClientConfig;

/// Events from the frame subscriber
#[derive(Debug)]
pub enum SubscriberEvent {
    /// An encoded frame arrived on a subscribed slot.
    ///
    /// `gap` is set when the slot's sequence skipped ahead, meaning at
    /// least one frame was dropped upstream. A sequence restarting at 1
    /// is a fresh stream on the slot, not a gap.
    Frame { frame: FrameMessage, gap: bool },

    /// The connection to the server is gone. Terminal: no further
    /// events follow.
    Disconnected { reason: String },
}

/// Frame stream subscriber
///
/// Connects to a stream server's viewer endpoint, subscribes to scanout
/// slots, and surfaces their frames as an event stream. Frames arrive in
/// sequence order per slot; dropped frames show up as a `gap` flag on
/// the next frame through.
///
/// # Example
/// ```no_run
/// use scanout_rs::client::{FrameSubscriber, SubscriberEvent};
///
/// # async fn example() -> scanout_rs::error::Result<()> {
/// let addr = "127.0.0.1:7500".parse().unwrap();
/// let (subscriber, mut events) = FrameSubscriber::connect(addr).await?;
/// subscriber.subscribe(0).await?;
///
/// while let Some(event) = events.recv().await {
///     match event {
///         SubscriberEvent::Frame { frame, gap } => {
///             println!("slot {} seq {} ({} bytes, gap: {gap})",
///                 frame.slot, frame.sequence, frame.payload.len());
///         }
///         SubscriberEvent::Disconnected { reason } => {
///             println!("disconnected: {reason}");
///             break;
///         }
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct FrameSubscriber {
    config: ClientConfig,
    cmd_tx: mpsc::Sender<IoCommand>,
    state: Arc<ClientState>,
}

impl FrameSubscriber {
    /// Connect with default configuration.
    ///
    /// Returns the subscriber and a receiver for its events.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<SubscriberEvent>)> {
        Self::connect_with(ClientConfig::new(addr)).await
    }

    /// Connect with explicit configuration.
    pub async fn connect_with(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<SubscriberEvent>)> {
        let stream = TcpStream::connect(config.server_addr).await?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "Failed to set TCP_NODELAY");
        }
        Ok(Self::from_stream(config, stream))
    }

    fn from_stream<S>(config: ClientConfig, stream: S) -> (Self, mpsc::Receiver<SubscriberEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let state = Arc::new(ClientState::default());

        let task = IoTask {
            decoder: Decoder::with_max_frame_len(config.max_frame_len),
            state: Arc::clone(&state),
            pending_acks: VecDeque::new(),
        };
        tokio::spawn(task.run(stream, cmd_rx, event_tx));

        let subscriber = Self {
            config,
            cmd_tx,
            state,
        };
        (subscriber, event_rx)
    }

    /// Subscribe to a slot and wait for the server's acknowledgement.
    ///
    /// If the slot is live and a keyframe is cached, the server follows
    /// the ack with a catch-up keyframe so decoding can start without
    /// waiting for the next one.
    pub async fn subscribe(&self, slot: u32) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(IoCommand::Subscribe { slot, ack })
            .await
            .map_err(|_| Error::NotConnected)?;

        match tokio::time::timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::Timeout {
                operation: "subscribe",
                slot,
                timeout: self.config.ack_timeout,
            }),
        }
    }

    /// Stop receiving frames for a slot. The server sends no reply.
    pub async fn unsubscribe(&self, slot: u32) -> Result<()> {
        self.cmd_tx
            .send(IoCommand::Unsubscribe { slot })
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Subscribe to each slot in turn, stopping at the first failure.
    ///
    /// Meant for re-establishing a known subscription set on a fresh
    /// connection after the previous one dropped.
    pub async fn resubscribe(&self, slots: &[u32]) -> Result<()> {
        for &slot in slots {
            self.subscribe(slot).await?;
        }
        Ok(())
    }

    /// Slots the server has acknowledged.
    pub fn subscriptions(&self) -> Vec<u32> {
        self.state.lock_subscriptions().iter().copied().collect()
    }

    /// Last sequence seen on a slot, if any frame has arrived.
    pub fn last_sequence(&self, slot: u32) -> Option<u64> {
        self.state.lock_sequences().get(&slot).copied()
    }

    /// Whether the connection's IO task is still running.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

enum IoCommand {
    Subscribe { slot: u32, ack: oneshot::Sender<()> },
    Unsubscribe { slot: u32 },
}

/// State shared between the handle and the IO task.
#[derive(Default)]
struct ClientState {
    subscriptions: Mutex<BTreeSet<u32>>,
    sequences: Mutex<HashMap<u32, u64>>,
}

impl ClientState {
    fn lock_subscriptions(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sequences(&self) -> MutexGuard<'_, HashMap<u32, u64>> {
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct IoTask {
    decoder: Decoder,
    state: Arc<ClientState>,
    pending_acks: VecDeque<(u32, oneshot::Sender<()>)>,
}

impl IoTask {
    async fn run<S>(
        mut self,
        stream: S,
        mut commands: mpsc::Receiver<IoCommand>,
        events: mpsc::Sender<SubscriberEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let reason = self.drive(stream, &mut commands, &events).await;

        // Drop pending ack senders so blocked subscribe() calls fail
        // fast instead of riding out their timeout.
        self.pending_acks.clear();
        debug!(reason = %reason, "Subscriber connection closed");
        let _ = events.send(SubscriberEvent::Disconnected { reason }).await;
    }

    async fn drive<S>(
        &mut self,
        stream: S,
        commands: &mut mpsc::Receiver<IoCommand>,
        events: &mpsc::Sender<SubscriberEvent>,
    ) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(64 * 1024);
        let mut write_buf = BytesMut::new();

        loop {
            tokio::select! {
                read = reader.read_buf(&mut read_buf) => {
                    match read {
                        Ok(0) => return "server closed the connection".to_string(),
                        Ok(_) => loop {
                            match self.decoder.decode(&mut read_buf) {
                                Ok(Some(msg)) => {
                                    if let Err(reason) = self
                                        .handle_message(msg, &mut write_buf, &mut writer, events)
                                        .await
                                    {
                                        return reason;
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => return format!("protocol error: {err}"),
                            }
                        },
                        Err(err) => return format!("read failed: {err}"),
                    }
                }
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        return "subscriber handle dropped".to_string();
                    };
                    if let Err(reason) = self.handle_command(cmd, &mut write_buf, &mut writer).await {
                        return reason;
                    }
                }
            }
        }
    }

    async fn handle_command<W>(
        &mut self,
        cmd: IoCommand,
        buf: &mut BytesMut,
        writer: &mut W,
    ) -> std::result::Result<(), String>
    where
        W: AsyncWrite + Unpin,
    {
        let msg = match cmd {
            IoCommand::Subscribe { slot, ack } => {
                self.pending_acks.push_back((slot, ack));
                Message::Subscribe { slot }
            }
            IoCommand::Unsubscribe { slot } => {
                self.state.lock_subscriptions().remove(&slot);
                self.state.lock_sequences().remove(&slot);
                Message::Unsubscribe { slot }
            }
        };
        Self::write_message(&msg, buf, writer).await
    }

    async fn handle_message<W>(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
        writer: &mut W,
        events: &mpsc::Sender<SubscriberEvent>,
    ) -> std::result::Result<(), String>
    where
        W: AsyncWrite + Unpin,
    {
        match msg {
            Message::SubscribeAck { slot } => {
                match self.pending_acks.iter().position(|(s, _)| *s == slot) {
                    Some(pos) => {
                        if let Some((_, ack)) = self.pending_acks.remove(pos) {
                            let _ = ack.send(());
                        }
                    }
                    None => debug!(slot, "Subscribe ack with no pending request"),
                }
                self.state.lock_subscriptions().insert(slot);
                Ok(())
            }
            Message::Frame(frame) => {
                let gap = self.note_sequence(&frame);
                if gap {
                    warn!(
                        slot = frame.slot,
                        sequence = frame.sequence,
                        "Frame gap detected"
                    );
                }
                if events
                    .send(SubscriberEvent::Frame { frame, gap })
                    .await
                    .is_err()
                {
                    return Err("event receiver dropped".to_string());
                }
                Ok(())
            }
            Message::Ping { token } => {
                Self::write_message(&Message::Pong { token }, buf, writer).await
            }
            other => {
                debug!(message = ?other, "Ignoring unexpected message");
                Ok(())
            }
        }
    }

    /// Record the frame's sequence. Returns true when frames were missed.
    fn note_sequence(&self, frame: &FrameMessage) -> bool {
        let mut sequences = self.state.lock_sequences();
        match sequences.insert(frame.slot, frame.sequence) {
            // The slot was disabled and re-enabled; its stream starts over.
            Some(_) if frame.sequence == 1 => {
                debug!(slot = frame.slot, "Stream restarted");
                false
            }
            Some(prev) => frame.sequence != prev + 1,
            None => false,
        }
    }

    async fn write_message<W>(
        msg: &Message,
        buf: &mut BytesMut,
        writer: &mut W,
    ) -> std::result::Result<(), String>
    where
        W: AsyncWrite + Unpin,
    {
        buf.clear();
        codec::encode(msg, buf);
        writer
            .write_all(buf)
            .await
            .map_err(|err| format!("write failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn test_config() -> ClientConfig {
        ClientConfig::new("127.0.0.1:7500".parse().unwrap())
            .ack_timeout(Duration::from_millis(250))
    }

    fn connect_pair() -> (
        FrameSubscriber,
        mpsc::Receiver<SubscriberEvent>,
        DuplexStream,
    ) {
        let (client_side, server_side) = tokio::io::duplex(256 * 1024);
        let (subscriber, events) = FrameSubscriber::from_stream(test_config(), client_side);
        (subscriber, events, server_side)
    }

    async fn send(stream: &mut DuplexStream, msg: &Message) {
        let mut buf = BytesMut::new();
        codec::encode(msg, &mut buf);
        stream.write_all(&buf).await.unwrap();
    }

    async fn recv(stream: &mut DuplexStream, decoder: &Decoder, buf: &mut BytesMut) -> Message {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(msg) = decoder.decode(buf).unwrap() {
                    return msg;
                }
                if stream.read_buf(buf).await.unwrap() == 0 {
                    panic!("Connection closed while waiting for a message");
                }
            }
        })
        .await
        .expect("Timed out waiting for a message")
    }

    async fn next_event(events: &mut mpsc::Receiver<SubscriberEvent>) -> SubscriberEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("Timed out waiting for an event")
            .expect("Event channel closed")
    }

    fn frame(slot: u32, sequence: u64, is_keyframe: bool) -> Message {
        Message::Frame(FrameMessage {
            slot,
            sequence,
            is_keyframe,
            timestamp_us: 1_000 * sequence,
            payload: Bytes::from_static(b"au"),
        })
    }

    #[tokio::test]
    async fn test_subscribe_ack_then_frames() {
        let (subscriber, mut events, mut server) = connect_pair();

        let server_task = tokio::spawn(async move {
            let decoder = Decoder::new();
            let mut buf = BytesMut::new();
            let req = recv(&mut server, &decoder, &mut buf).await;
            assert_eq!(req, Message::Subscribe { slot: 2 });
            send(&mut server, &Message::SubscribeAck { slot: 2 }).await;
            send(&mut server, &frame(2, 1, true)).await;
            send(&mut server, &frame(2, 2, false)).await;
            server
        });

        subscriber.subscribe(2).await.unwrap();
        assert_eq!(subscriber.subscriptions(), vec![2]);

        match next_event(&mut events).await {
            SubscriberEvent::Frame { frame, gap } => {
                assert_eq!(frame.slot, 2);
                assert_eq!(frame.sequence, 1);
                assert!(frame.is_keyframe);
                assert!(!gap);
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        match next_event(&mut events).await {
            SubscriberEvent::Frame { frame, gap } => {
                assert_eq!(frame.sequence, 2);
                assert!(!gap);
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        assert_eq!(subscriber.last_sequence(2), Some(2));

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_sequence_flags_gap() {
        let (subscriber, mut events, mut server) = connect_pair();

        let server_task = tokio::spawn(async move {
            let decoder = Decoder::new();
            let mut buf = BytesMut::new();
            recv(&mut server, &decoder, &mut buf).await;
            send(&mut server, &Message::SubscribeAck { slot: 0 }).await;
            send(&mut server, &frame(0, 1, true)).await;
            send(&mut server, &frame(0, 3, false)).await;
            server
        });

        subscriber.subscribe(0).await.unwrap();

        match next_event(&mut events).await {
            SubscriberEvent::Frame { gap, .. } => assert!(!gap),
            other => panic!("Unexpected event: {other:?}"),
        }
        match next_event(&mut events).await {
            SubscriberEvent::Frame { frame, gap } => {
                assert_eq!(frame.sequence, 3);
                assert!(gap);
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        assert_eq!(subscriber.last_sequence(0), Some(3));

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_sequence_restart_is_not_a_gap() {
        let (subscriber, mut events, mut server) = connect_pair();

        let server_task = tokio::spawn(async move {
            let decoder = Decoder::new();
            let mut buf = BytesMut::new();
            recv(&mut server, &decoder, &mut buf).await;
            send(&mut server, &Message::SubscribeAck { slot: 0 }).await;
            send(&mut server, &frame(0, 1, true)).await;
            send(&mut server, &frame(0, 2, false)).await;
            // Slot re-enabled: sequence starts over.
            send(&mut server, &frame(0, 1, true)).await;
            server
        });

        subscriber.subscribe(0).await.unwrap();

        for expected_gap in [false, false, false] {
            match next_event(&mut events).await {
                SubscriberEvent::Frame { gap, .. } => assert_eq!(gap, expected_gap),
                other => panic!("Unexpected event: {other:?}"),
            }
        }
        assert_eq!(subscriber.last_sequence(0), Some(1));

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_times_out_without_ack() {
        let (subscriber, _events, mut server) = connect_pair();

        let server_task = tokio::spawn(async move {
            let decoder = Decoder::new();
            let mut buf = BytesMut::new();
            // Read the request, never ack it.
            recv(&mut server, &decoder, &mut buf).await;
            server
        });

        let err = subscriber.subscribe(0).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "subscribe", .. }));
        assert!(subscriber.subscriptions().is_empty());

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_close_emits_disconnected() {
        let (subscriber, mut events, server) = connect_pair();
        drop(server);

        match next_event(&mut events).await {
            SubscriberEvent::Disconnected { .. } => {}
            other => panic!("Unexpected event: {other:?}"),
        }

        let err = subscriber.subscribe(0).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let (_subscriber, _events, mut server) = connect_pair();
        let decoder = Decoder::new();
        let mut buf = BytesMut::new();

        send(&mut server, &Message::Ping { token: 7 }).await;
        let reply = recv(&mut server, &decoder, &mut buf).await;
        assert_eq!(reply, Message::Pong { token: 7 });
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_local_state() {
        let (subscriber, mut events, mut server) = connect_pair();

        let server_task = tokio::spawn(async move {
            let decoder = Decoder::new();
            let mut buf = BytesMut::new();
            recv(&mut server, &decoder, &mut buf).await;
            send(&mut server, &Message::SubscribeAck { slot: 1 }).await;
            send(&mut server, &frame(1, 1, true)).await;
            let next = recv(&mut server, &decoder, &mut buf).await;
            assert_eq!(next, Message::Unsubscribe { slot: 1 });
            server
        });

        subscriber.subscribe(1).await.unwrap();
        match next_event(&mut events).await {
            SubscriberEvent::Frame { .. } => {}
            other => panic!("Unexpected event: {other:?}"),
        }
        assert_eq!(subscriber.last_sequence(1), Some(1));

        subscriber.unsubscribe(1).await.unwrap();
        let _server = server_task.await.unwrap();

        assert!(subscriber.subscriptions().is_empty());
        assert_eq!(subscriber.last_sequence(1), None);
    }
}
