//! TCP bus link.
//!
//! Nodes in separate processes share a bus by linking to a [`BusHub`].
//! Frames on the link are length-prefixed:
//!
//! ```text
//! ┌──────────────┬─────────┬─────────────┬──────────────┐
//! │ Length (4B)  │ Sub (1B)│ Subject     │ Payload      │
//! │ big-endian   │ length  │ (Sub bytes) │              │
//! └──────────────┴─────────┴─────────────┴──────────────┘
//! ```
//!
//! Length counts everything after itself.
//!
//! The first connect must succeed. After that the link reconnects forever;
//! publishing while it is down fails instead of queueing.
//!
//! [`BusHub`]: crate::hub::BusHub

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chat_relay_core::bus::validate_subject;
use chat_relay_core::{Bus, BusError, Subscription};
use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Maximum bus frame size, excluding the length prefix.
pub const MAX_BUS_FRAME: usize = 1024 * 1024;

/// Length prefix size.
const LENGTH_PREFIX: usize = 4;

/// TCP bus link configuration.
#[derive(Debug, Clone)]
pub struct TcpBusConfig {
    /// Hub address (`host:port`).
    pub addr: String,
    /// Timeout for each connect attempt.
    pub connect_timeout: Duration,
    /// Wait between reconnect attempts.
    pub reconnect_wait: Duration,
    /// Frames queued for the hub before publish reports backpressure.
    pub queue_capacity: usize,
    /// Per-subject buffer for local subscribers.
    pub subscriber_capacity: usize,
}

impl Default for TcpBusConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:4222".to_string(),
            connect_timeout: Duration::from_secs(5),
            reconnect_wait: Duration::from_secs(2),
            queue_capacity: 1024,
            subscriber_capacity: 1024,
        }
    }
}

/// Encode a bus frame, length prefix included.
///
/// # Errors
///
/// Returns an error if the subject is invalid or the frame is too large.
pub fn encode_frame(subject: &str, payload: &[u8]) -> Result<Bytes, BusError> {
    validate_subject(subject).map_err(BusError::InvalidSubject)?;

    let body = 1 + subject.len() + payload.len();
    if body > MAX_BUS_FRAME {
        return Err(BusError::FrameTooLarge(body));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + body);
    buf.put_u32(body as u32);
    buf.put_u8(subject.len() as u8);
    buf.put_slice(subject.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split a frame produced by [`read_frame`] into subject and payload.
///
/// # Errors
///
/// Returns an error if the subject does not fit in the frame or is not
/// valid UTF-8.
pub fn split_frame(frame: &Bytes) -> Result<(String, Bytes), BusError> {
    let body = frame.slice(LENGTH_PREFIX.min(frame.len())..);
    let subject_len = *body
        .first()
        .ok_or_else(|| BusError::InvalidFrame("empty frame".to_string()))?
        as usize;

    if body.len() < 1 + subject_len {
        return Err(BusError::InvalidFrame(format!(
            "subject length {} exceeds frame",
            subject_len
        )));
    }

    let subject = std::str::from_utf8(&body[1..1 + subject_len])
        .map_err(|_| BusError::InvalidFrame("subject is not UTF-8".to_string()))?
        .to_string();
    Ok((subject, body.slice(1 + subject_len..)))
}

/// Read one frame, length prefix included.
///
/// Returns `Ok(None)` only when the stream ends before any byte of the next
/// frame arrives.
///
/// # Errors
///
/// Returns an error on I/O failure, a torn frame, or an oversize length.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, BusError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        match reader.read(&mut prefix[filled..]).await {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(BusError::InvalidFrame(format!(
                    "stream ended after {} of {} length bytes",
                    filled, LENGTH_PREFIX
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let body = u32::from_be_bytes(prefix) as usize;
    if body > MAX_BUS_FRAME {
        return Err(BusError::FrameTooLarge(body));
    }

    let mut buf = BytesMut::zeroed(LENGTH_PREFIX + body);
    buf[..LENGTH_PREFIX].copy_from_slice(&prefix);
    reader.read_exact(&mut buf[LENGTH_PREFIX..]).await?;
    Ok(Some(buf.freeze()))
}

/// Subscriber side shared with the link task.
#[derive(Debug)]
struct Shared {
    subjects: DashMap<String, broadcast::Sender<Bytes>>,
    connected: AtomicBool,
    capacity: usize,
}

impl Shared {
    fn dispatch(&self, frame: &Bytes) -> Result<(), BusError> {
        let (subject, payload) = split_frame(frame)?;
        match self.subjects.get(&subject) {
            Some(tx) => {
                let receivers = tx.send(payload).unwrap_or_default();
                trace!(subject = %subject, receivers, "Bus frame dispatched");
            }
            None => trace!(subject = %subject, "Bus frame for unknown subject dropped"),
        }
        Ok(())
    }
}

/// A [`Bus`] backed by a TCP link to a hub.
#[derive(Debug)]
pub struct TcpBus {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Bytes>,
    link: JoinHandle<()>,
}

impl TcpBus {
    /// Connect to the hub and start the link.
    ///
    /// # Errors
    ///
    /// Returns an error if the first connect fails or times out.
    pub async fn connect(config: TcpBusConfig) -> Result<Self, BusError> {
        let stream = connect_once(&config).await?;
        info!(hub = %config.addr, "Connected to bus");

        let shared = Arc::new(Shared {
            subjects: DashMap::new(),
            connected: AtomicBool::new(true),
            capacity: config.subscriber_capacity.max(1),
        });
        let (outbound, queue) = mpsc::channel(config.queue_capacity.max(1));
        let link = tokio::spawn(run_link(config, stream, queue, Arc::clone(&shared)));

        Ok(Self {
            shared,
            outbound,
            link,
        })
    }

    /// Whether the link to the hub is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.link.abort();
    }
}

#[async_trait]
impl Bus for TcpBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }

        let frame = encode_frame(subject, &payload)?;
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BusError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => BusError::Disconnected,
        })
    }

    fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        validate_subject(subject).map_err(BusError::InvalidSubject)?;

        let receiver = self
            .shared
            .subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(self.shared.capacity).0)
            .subscribe();

        debug!(subject = %subject, "Subscribed");
        Ok(Subscription::new(subject, receiver))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

async fn connect_once(config: &TcpBusConfig) -> Result<TcpStream, BusError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.addr))
        .await
        .map_err(|_| {
            BusError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out", config.addr),
            ))
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Keep the link up until the bus is dropped.
async fn run_link(
    config: TcpBusConfig,
    mut stream: TcpStream,
    mut queue: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
) {
    loop {
        shared.connected.store(true, Ordering::Release);
        let lost = serve(stream, &mut queue, &shared).await;
        shared.connected.store(false, Ordering::Release);

        match lost {
            Some(e) => warn!(hub = %config.addr, error = %e, "Bus link lost"),
            None => {
                debug!(hub = %config.addr, "Bus closed");
                return;
            }
        }

        // Frames queued for the old link are not replayed.
        let mut discarded = 0usize;
        while queue.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "Dropped frames queued before link loss");
        }

        stream = loop {
            tokio::time::sleep(config.reconnect_wait).await;
            match connect_once(&config).await {
                Ok(stream) => break stream,
                Err(e) => debug!(hub = %config.addr, error = %e, "Reconnect failed"),
            }
        };
        info!(hub = %config.addr, "Reconnected to bus");
    }
}

/// Pump frames both ways over one connection.
///
/// Returns the error that ended the link, or `None` if the bus itself is
/// gone.
async fn serve(
    stream: TcpStream,
    queue: &mut mpsc::Receiver<Bytes>,
    shared: &Arc<Shared>,
) -> Option<BusError> {
    let (mut reader, mut writer) = stream.into_split();
    let inbound = Arc::clone(shared);
    let mut reading: JoinHandle<Result<(), BusError>> = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if let Err(e) = inbound.dispatch(&frame) {
                        warn!(error = %e, "Dropping bus frame");
                    }
                }
                Ok(None) => return Err(BusError::Disconnected),
                Err(e) => return Err(e),
            }
        }
    });

    let lost = loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        break Some(BusError::Io(e));
                    }
                }
                None => break None,
            },
            read = &mut reading => break Some(match read {
                Ok(Err(e)) => e,
                _ => BusError::Disconnected,
            }),
        }
    };

    reading.abort();
    lost
}
