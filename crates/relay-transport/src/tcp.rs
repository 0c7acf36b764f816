//! TCP transport for chat clients.
//!
//! Each accepted connection gets a reader task and a writer task. The reader
//! pulls whole messages off the socket and hands them to the
//! [`MessageHandler`] one at a time. The writer drains a bounded queue that
//! the [`ConnectionTable`] feeds, so sends to a slow client never block the
//! router.

use bytes::Bytes;
use chat_relay_core::{MessageHandler, Outbound, TransportError};
use dashmap::DashMap;
use relay_protocol::{codec, read_message, HeaderRetry, ProtocolError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum simultaneous client connections.
    pub max_connections: usize,
    /// Per-connection outbound queue length.
    pub outbound_queue: usize,
    /// Header read retry policy.
    pub header_retry: HeaderRetry,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6000)),
            max_connections: 10_000,
            outbound_queue: 256,
            header_retry: HeaderRetry::default(),
        }
    }
}

/// Open connections, keyed by peer address.
///
/// Implements [`Outbound`]: a send is queued for the connection's writer task
/// and never waits.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    writers: DashMap<SocketAddr, mpsc::Sender<Bytes>>,
}

impl ConnectionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and return the receiving end of its queue.
    pub fn register(&self, addr: SocketAddr, capacity: usize) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if self.writers.insert(addr, tx).is_some() {
            warn!(connection = %addr, "Replaced existing connection");
        }
        rx
    }

    /// Remove a connection. Its writer finishes the queued data and exits.
    pub fn unregister(&self, addr: SocketAddr) -> bool {
        self.writers.remove(&addr).is_some()
    }

    /// Whether `addr` is connected.
    #[must_use]
    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.writers.contains_key(&addr)
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    /// Whether there are no open connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

impl Outbound for ConnectionTable {
    fn send(&self, addr: SocketAddr, data: Bytes) -> Result<(), TransportError> {
        let tx = self
            .writers
            .get(&addr)
            .ok_or(TransportError::NotConnected(addr))?;

        tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(addr),
            mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected(addr),
        })
    }
}

/// TCP server for chat clients.
pub struct TcpServer {
    listener: TcpListener,
    config: TcpConfig,
    connections: Arc<ConnectionTable>,
    handler: Arc<dyn MessageHandler>,
}

impl TcpServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(
        config: TcpConfig,
        connections: Arc<ConnectionTable>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            max_connections = config.max_connections,
            "Chat server listening"
        );

        Ok(Self {
            listener,
            config,
            connections,
            handler,
        })
    }

    /// The address the server is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// The table of open connections.
    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    /// Accept connections until `shutdown` completes, then close every
    /// connection and wait for their tasks to finish.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged and skipped.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send,
    {
        let TcpServer {
            listener,
            config,
            connections,
            handler,
        } = self;
        let (closing_tx, closing_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    if connections.len() >= config.max_connections {
                        warn!(connection = %addr, error = %TransportError::LimitReached, "Rejecting connection");
                        continue;
                    }

                    let queue = connections.register(addr, config.outbound_queue);
                    let connection = Connection {
                        addr,
                        connections: Arc::clone(&connections),
                        handler: Arc::clone(&handler),
                        retry: config.header_retry,
                        closing: closing_rx.clone(),
                    };
                    tasks.spawn(connection.run(stream, queue));
                }
            }
        }

        info!(open = connections.len(), "Chat server shutting down");
        let _ = closing_tx.send(true);
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

/// State for one client connection.
struct Connection {
    addr: SocketAddr,
    connections: Arc<ConnectionTable>,
    handler: Arc<dyn MessageHandler>,
    retry: HeaderRetry,
    closing: watch::Receiver<bool>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream, queue: mpsc::Receiver<Bytes>) {
        let addr = self.addr;
        debug!(connection = %addr, "Accepted connection");

        let (mut reader, writer) = stream.into_split();
        tokio::spawn(write_loop(addr, writer, queue));
        self.handler.on_connect(addr).await;

        loop {
            let read = tokio::select! {
                read = read_message(&mut reader, &self.retry) => read,
                _ = self.closing.changed() => {
                    debug!(connection = %addr, "Closing connection for shutdown");
                    break;
                }
            };

            match read {
                Ok(frame) => match codec::decode(&frame) {
                    Ok(message) => self.handler.on_message(addr, message).await,
                    Err(e) => warn!(connection = %addr, error = %e, "Discarding malformed message"),
                },
                Err(ProtocolError::Closed) => {
                    debug!(connection = %addr, "Connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(connection = %addr, error = %e, "Read failed, closing connection");
                    break;
                }
            }
        }

        self.connections.unregister(addr);
        self.handler.on_drop(addr).await;
        debug!(connection = %addr, "Connection dropped");
    }
}

/// Write queued messages to the socket until the queue closes.
async fn write_loop(addr: SocketAddr, mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(data) = queue.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(connection = %addr, error = %e, "Write failed");
            return;
        }
        trace!(connection = %addr, bytes = data.len(), "Wrote");
    }
    let _ = writer.shutdown().await;
}
