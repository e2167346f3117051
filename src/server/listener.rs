//! Relay server listeners
//!
//! Accepts on both TCP listeners and runs a dispatch task per connection.
//! Dispatch tasks live in a [`TaskGroup`]; the ones still greeting or routing
//! when the server stops are aborted and awaited before the brokers shut down.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::broker::{CameraRoster, ClientDirectory, RecordSink, Relay, TaskGroup};
use crate::error::Result;
use crate::protocol::RelayCodec;
use crate::server::config::RelayConfig;
use crate::server::dispatcher::{Dispatcher, Endpoint};
use crate::session::Connection;

/// Both listening sockets, bound but not yet accepting
pub struct BoundListeners {
    internal: TcpListener,
    external: TcpListener,
}

impl BoundListeners {
    /// Actual address of the viewer listener (useful with port 0)
    pub fn internal_addr(&self) -> io::Result<SocketAddr> {
        self.internal.local_addr()
    }

    /// Actual address of the agent listener
    pub fn external_addr(&self) -> io::Result<SocketAddr> {
        self.external.local_addr()
    }
}

/// Camera relay server
pub struct RelayServer {
    config: RelayConfig,
    relay: Relay,
    dispatcher: Dispatcher,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl RelayServer {
    /// Start the brokers and prepare the listeners
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<D>(config: RelayConfig, directory: Arc<D>) -> Self
    where
        D: CameraRoster + ClientDirectory + RecordSink + 'static,
    {
        let relay = Relay::start(&config.broker, directory);
        let dispatcher = Dispatcher::new(&relay, config.handshake_timeout);

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            relay,
            dispatcher,
            connection_semaphore,
        }
    }

    /// The running brokers
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Bind both listeners
    pub async fn bind(&self) -> Result<BoundListeners> {
        let internal = TcpListener::bind(self.config.internal_addr).await?;
        let external = TcpListener::bind(self.config.external_addr).await?;

        tracing::info!(addr = %internal.local_addr()?, "Internal listener bound");
        tracing::info!(addr = %external.local_addr()?, "External listener bound");

        Ok(BoundListeners { internal, external })
    }

    /// Run with graceful shutdown
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listeners = self.bind().await?;
        self.serve(listeners, shutdown).await
    }

    /// Accept on already bound listeners until `shutdown` completes
    ///
    /// The brokers are stopped before this returns.
    pub async fn serve<F>(self, listeners: BoundListeners, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = pin!(shutdown);
        let mut connections = TaskGroup::new("connections");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                accepted = listeners.internal.accept() => {
                    self.on_accept(accepted, Endpoint::Internal, &mut connections);
                }
                accepted = listeners.external.accept() => {
                    self.on_accept(accepted, Endpoint::External, &mut connections);
                }
                Some(()) = connections.reap(), if !connections.is_empty() => {}
            }
        }

        drop(listeners);
        connections.shutdown().await;
        self.relay.shutdown().await;

        Ok(())
    }

    fn on_accept(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        endpoint: Endpoint,
        connections: &mut TaskGroup,
    ) {
        match accepted {
            Ok((socket, peer_addr)) => {
                self.handle_connection(socket, peer_addr, endpoint, connections);
            }
            Err(e) => {
                tracing::error!(
                    endpoint = endpoint.name(),
                    error = %e,
                    "Failed to accept connection"
                );
            }
        }
    }

    fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        endpoint: Endpoint,
        connections: &mut TaskGroup,
    ) {
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

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let codec = RelayCodec::with_limits(self.config.max_line_length, self.config.max_chunk_size);
        let connection = Connection::with_codec(socket, peer_addr.to_string(), codec);
        let connection_id = connection.id();

        tracing::debug!(
            connection = %connection_id,
            peer = %peer_addr,
            endpoint = endpoint.name(),
            "New connection"
        );

        let dispatcher = self.dispatcher.clone();
        connections.spawn(async move {
            let _permit = permit;

            if let Err(e) = dispatcher.handle(connection, endpoint).await {
                tracing::debug!(
                    connection = %connection_id,
                    error = %e,
                    "Connection error"
                );
            }
        });
    }

    /// Configured viewer listener address
    pub fn internal_addr(&self) -> SocketAddr {
        self.config.internal_addr
    }

    /// Configured agent listener address
    pub fn external_addr(&self) -> SocketAddr {
        self.config.external_addr
    }
}
