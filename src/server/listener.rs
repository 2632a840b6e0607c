//! Stream server listeners.
//!
//! Two accept loops share one hub: the viewer listener and the control
//! listener. A connection's role is decided by which listener accepted
//! it, never by anything the peer sends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::hub::{ConnectionId, Hub};
use crate::protocol::ConnectionRole;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::server::control::ControlHandle;
use crate::stats::ServerStats;

/// Frame streaming server.
pub struct StreamServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    control: ControlHandle,
    stats: Arc<ServerStats>,
    next_conn_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    running: AtomicBool,
    max_frame_len: Arc<AtomicUsize>,
}

impl StreamServer {
    /// Create a server over an existing hub and control handle.
    pub fn new(
        config: ServerConfig,
        hub: Arc<Hub>,
        control: ControlHandle,
        stats: Arc<ServerStats>,
    ) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };
        hub.set_queue_depth(config.subscriber_queue_depth);
        let max_frame_len = Arc::new(AtomicUsize::new(config.max_frame_len));

        Self {
            config,
            hub,
            control,
            stats,
            next_conn_id: AtomicU64::new(1),
            connection_semaphore,
            running: AtomicBool::new(false),
            max_frame_len,
        }
    }

    /// Handle for reconfiguring the server while it runs.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            hub: Arc::clone(&self.hub),
            control: self.control.clone(),
            max_frame_len: Arc::clone(&self.max_frame_len),
            viewer_addr: self.config.viewer_addr,
            control_addr: self.config.control_addr,
            max_connections: self.config.max_connections,
        }
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Run the server until the process ends.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run the server with graceful shutdown.
    ///
    /// A second `run` or `run_until` on a server that is already running
    /// fails with [`Error::ReinitRace`]: reconfiguration goes through
    /// [`ServerHandle::reinit`], not through another run call.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::ReinitRace);
        }

        let result = self.serve(shutdown).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let viewer_listener = TcpListener::bind(self.config.viewer_addr).await?;
        let control_listener = TcpListener::bind(self.config.control_addr).await?;
        tracing::info!(
            viewer = %self.config.viewer_addr,
            control = %self.config.control_addr,
            slots = self.hub.slot_count(),
            "Scanout stream server listening"
        );

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&viewer_listener, ConnectionRole::Viewer) => result,
            result = self.accept_loop(&control_listener, ConnectionRole::Control) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener, role: ConnectionRole) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr, role).await;
                }
                Err(e) => {
                    tracing::error!(role = %role, error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr, role: ConnectionRole) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(conn = %id, peer = %peer_addr, role = %role, "New connection");

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(conn = %id, error = %e, "Failed to configure socket");
            return;
        }

        // Pick up tunables merged by reinit since startup.
        let mut config = self.config.clone();
        config.max_frame_len = self.max_frame_len.load(Ordering::Relaxed);

        let hub = Arc::clone(&self.hub);
        let control = self.control.clone();

        tokio::spawn(async move {
            // Held for the connection's lifetime.
            let _permit = permit;
            let connection =
                Connection::new(id, role, peer_addr.to_string(), socket, config, hub, control);
            if let Err(e) = connection.run().await {
                tracing::debug!(conn = %id, error = %e, "Connection error");
            }
            tracing::debug!(conn = %id, "Connection closed");
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }

    pub fn viewer_addr(&self) -> SocketAddr {
        self.config.viewer_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.config.control_addr
    }
}

/// What a [`ServerHandle::reinit`] call actually changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReinitOutcome {
    pub queue_depth_updated: bool,
    pub max_frame_len_updated: bool,
    /// Fields the new config wanted to change that cannot change while
    /// the server is running.
    pub rejected: Vec<&'static str>,
}

/// Reconfiguration handle, valid while the server runs.
#[derive(Clone)]
pub struct ServerHandle {
    hub: Arc<Hub>,
    control: ControlHandle,
    max_frame_len: Arc<AtomicUsize>,
    viewer_addr: SocketAddr,
    control_addr: SocketAddr,
    max_connections: usize,
}

impl ServerHandle {
    /// Merge a new configuration into the running server.
    ///
    /// Live connections, their subscriptions, and all serving slots are
    /// untouched. Queue depth applies to connections accepted from now
    /// on; so does the frame length bound. Bind addresses and the
    /// connection limit cannot change without a restart and are reported
    /// in [`ReinitOutcome::rejected`].
    pub fn reinit(&self, config: &ServerConfig) -> ReinitOutcome {
        let mut outcome = ReinitOutcome::default();

        if config.subscriber_queue_depth != self.hub.queue_depth() {
            self.hub.set_queue_depth(config.subscriber_queue_depth);
            outcome.queue_depth_updated = true;
        }

        if config.max_frame_len != self.max_frame_len.load(Ordering::Relaxed) {
            self.max_frame_len
                .store(config.max_frame_len, Ordering::Relaxed);
            outcome.max_frame_len_updated = true;
            tracing::info!(max_frame_len = config.max_frame_len, "Frame length bound updated");
        }

        if config.viewer_addr != self.viewer_addr {
            outcome.rejected.push("viewer_addr");
        }
        if config.control_addr != self.control_addr {
            outcome.rejected.push("control_addr");
        }
        if config.max_connections != self.max_connections {
            outcome.rejected.push("max_connections");
        }
        if !outcome.rejected.is_empty() {
            tracing::warn!(rejected = ?outcome.rejected, "Reinit ignored immutable fields");
        }

        tracing::info!(
            queue_depth = outcome.queue_depth_updated,
            max_frame_len = outcome.max_frame_len_updated,
            "Reinitialization merged"
        );
        outcome
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{CopyEncoder, EncoderConfig, EncoderSessions};
    use std::time::Duration;

    fn test_config() -> ServerConfig {
        ServerConfig::default()
            .viewer_bind("127.0.0.1:0".parse().unwrap())
            .control_bind("127.0.0.1:0".parse().unwrap())
    }

    async fn rig(config: ServerConfig) -> (Arc<StreamServer>, Arc<Hub>) {
        let stats = Arc::new(ServerStats::new());
        let hub = Arc::new(Hub::new(4, config.subscriber_queue_depth, Arc::clone(&stats)));
        let (sessions, _faults) = EncoderSessions::start(
            EncoderConfig::new(),
            Arc::new(CopyEncoder::new()),
            Arc::clone(&hub),
            Arc::clone(&stats),
        );
        let control = ControlHandle::new(Arc::clone(&hub), sessions);
        let server = Arc::new(StreamServer::new(config, Arc::clone(&hub), control, stats));
        (server, hub)
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let (server, _hub) = rig(test_config()).await;
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .run_until(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = server.run().await;
        assert!(matches!(second, Err(Error::ReinitRace)));

        shutdown_tx.send(()).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_again_after_shutdown() {
        let (server, _hub) = rig(test_config()).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .run_until(async {
                        let _ = rx.await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        runner.await.unwrap().unwrap();

        // The guard resets once the first run completes.
        let (tx2, rx2) = tokio::sync::oneshot::channel::<()>();
        let server2 = Arc::clone(&server);
        let runner2 = tokio::spawn(async move {
            server2
                .run_until(async {
                    let _ = rx2.await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx2.send(()).unwrap();
        runner2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reinit_preserves_connections_and_subscriptions() {
        let (server, hub) = rig(test_config()).await;
        let handle = server.handle();

        // Two registered connections with live subscriptions.
        let a = ConnectionId(1);
        let b = ConnectionId(2);
        let queue_a = hub.register_connection(a, "a").await;
        let queue_b = hub.register_connection(b, "b").await;
        hub.subscribe(a, 0).await.unwrap();
        hub.subscribe(b, 1).await.unwrap();

        let new_config = test_config()
            .subscriber_queue_depth(64)
            .max_frame_len(1024);
        let outcome = handle.reinit(&new_config);

        assert!(outcome.queue_depth_updated);
        assert!(outcome.max_frame_len_updated);
        assert!(outcome.rejected.is_empty());

        assert!(!queue_a.is_closed());
        assert!(!queue_b.is_closed());
        assert_eq!(hub.subscriber_count(0).await, 1);
        assert_eq!(hub.subscriber_count(1).await, 1);
        assert_eq!(hub.queue_depth(), 64);
    }

    #[tokio::test]
    async fn test_reinit_rejects_address_changes() {
        let (server, _hub) = rig(test_config()).await;
        let handle = server.handle();

        let mut new_config = test_config();
        new_config.viewer_addr = "127.0.0.1:9999".parse().unwrap();
        new_config.max_connections = 10;

        let outcome = handle.reinit(&new_config);
        assert_eq!(outcome.rejected, vec!["viewer_addr", "max_connections"]);
    }
}
