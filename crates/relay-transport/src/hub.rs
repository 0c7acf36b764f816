//! Bus hub.
//!
//! Accepts [`TcpBus`](crate::bus::TcpBus) links and forwards every frame it
//! reads to every connected link, the sender included. Frames are passed on
//! as read; the hub never looks inside them.

use crate::bus::read_frame;
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Frames queued per link before the hub starts dropping for it.
const DEFAULT_LINK_QUEUE: usize = 1024;

/// The fan-out point for TCP bus links.
pub struct BusHub {
    listener: TcpListener,
    links: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    link_queue: usize,
}

impl BusHub {
    /// Bind the hub's listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Bus hub listening");
        Ok(Self {
            listener,
            links: Arc::new(DashMap::new()),
            link_queue: DEFAULT_LINK_QUEUE,
        })
    }

    /// Set the per-link outbound queue length.
    #[must_use]
    pub fn with_link_queue(mut self, link_queue: usize) -> Self {
        self.link_queue = link_queue.max(1);
        self
    }

    /// The address the hub is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve links until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged and skipped.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let BusHub {
            listener,
            links,
            link_queue,
        } = self;
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let queue = register(&links, peer, link_queue);
                        tasks.spawn(serve_link(stream, peer, Arc::clone(&links), queue));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept bus link"),
                },
            }
        }

        info!(links = links.len(), "Bus hub shutting down");
        tasks.shutdown().await;
        links.clear();
        Ok(())
    }
}

fn register(
    links: &DashMap<SocketAddr, mpsc::Sender<Bytes>>,
    peer: SocketAddr,
    capacity: usize,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(capacity);
    links.insert(peer, tx);
    info!(link = %peer, links = links.len(), "Bus link connected");
    rx
}

async fn serve_link(
    stream: TcpStream,
    peer: SocketAddr,
    links: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    queue: mpsc::Receiver<Bytes>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let writing = tokio::spawn(write_link(peer, writer, queue));

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => fan_out(&links, peer, &frame),
            Ok(None) => {
                debug!(link = %peer, "Bus link closed");
                break;
            }
            Err(e) => {
                warn!(link = %peer, error = %e, "Bus link read failed");
                break;
            }
        }
    }

    links.remove(&peer);
    writing.abort();
    info!(link = %peer, links = links.len(), "Bus link disconnected");
}

fn fan_out(links: &DashMap<SocketAddr, mpsc::Sender<Bytes>>, from: SocketAddr, frame: &Bytes) {
    let mut sent = 0usize;
    for link in links.iter() {
        match link.value().try_send(frame.clone()) {
            Ok(()) => sent += 1,
            Err(e) => warn!(link = %link.key(), error = %e, "Dropping frame for slow link"),
        }
    }
    trace!(from = %from, bytes = frame.len(), links = sent, "Forwarded");
}

async fn write_link(peer: SocketAddr, mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(link = %peer, error = %e, "Bus link write failed");
            return;
        }
    }
}
