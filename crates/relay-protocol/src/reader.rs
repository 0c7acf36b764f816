//! Reading whole messages off a byte stream.
//!
//! Headers may arrive fragmented, so the header read retries a bounded number
//! of times with exponential backoff. The payload read does not retry: once
//! the header is in, a torn payload is a dead connection.

use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::{payload_len, ProtocolError, HEADER_LEN};

/// Retry policy for header reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRetry {
    /// Number of read attempts before giving up.
    pub attempts: u32,
    /// Backoff unit; attempt `n` waits `base * 2^n`.
    pub base: Duration,
}

impl HeaderRetry {
    /// Default number of attempts.
    pub const DEFAULT_ATTEMPTS: u32 = 3;

    /// Create a new retry policy.
    #[must_use]
    pub const fn new(attempts: u32, base: Duration) -> Self {
        Self { attempts, base }
    }

    /// Delay after the given (zero-based) failed attempt.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for HeaderRetry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ATTEMPTS, Duration::from_secs(1))
    }
}

/// Read one complete message (header and payload) from `reader`.
///
/// The returned buffer is suitable for [`decode`](crate::codec::decode); its
/// length is the full message length.
///
/// # Errors
///
/// - [`ProtocolError::Closed`] if the stream ends before a header starts.
/// - [`ProtocolError::HeaderIncomplete`] if the header is still short after
///   the retry budget.
/// - [`ProtocolError::Io`] for any other header I/O error.
/// - [`ProtocolError::Payload`] if the payload cannot be read in full.
pub async fn read_message<R>(reader: &mut R, retry: &HeaderRetry) -> Result<Bytes, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let header = read_header(reader, retry).await?;
    let length = payload_len(&header);

    let mut buf = BytesMut::zeroed(HEADER_LEN + length);
    buf[..HEADER_LEN].copy_from_slice(&header);
    reader
        .read_exact(&mut buf[HEADER_LEN..])
        .await
        .map_err(ProtocolError::Payload)?;

    Ok(buf.freeze())
}

/// Read the fixed-size header, retrying short reads with backoff.
///
/// Each attempt reads until the header is full or the stream reports end of
/// data. An attempt that makes no progress at all means the peer is gone and
/// fails at once; an attempt that makes some progress sleeps and tries again.
///
/// # Errors
///
/// See [`read_message`].
pub async fn read_header<R>(
    reader: &mut R,
    retry: &HeaderRetry,
) -> Result<[u8; HEADER_LEN], ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    let attempts = retry.attempts.max(1);

    for attempt in 0..attempts {
        let start = filled;
        filled += fill(reader, &mut header[filled..]).await?;

        if filled == HEADER_LEN {
            return Ok(header);
        }
        if filled == start {
            if filled == 0 {
                return Err(ProtocolError::Closed);
            }
            return Err(ProtocolError::HeaderIncomplete {
                received: filled,
                attempts: attempt + 1,
            });
        }

        tokio::time::sleep(retry.backoff(attempt)).await;
    }

    Err(ProtocolError::HeaderIncomplete {
        received: filled,
        attempts,
    })
}

/// Read into `buf` until it is full or the reader reports end of data.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut n = 0;
    while n < buf.len() {
        match reader.read(&mut buf[n..]).await {
            Ok(0) => break,
            Ok(read) => n += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};
    use crate::message::ChatMessage;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::time::Instant;

    /// One scripted reader event.
    enum Step {
        Data(Vec<u8>),
        Eof,
        Fail(io::ErrorKind),
    }

    /// A reader that replays a fixed script, reporting end of data in the
    /// middle of the stream when told to.
    struct ScriptedReader {
        steps: VecDeque<Step>,
    }

    impl ScriptedReader {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
            }
        }
    }

    impl AsyncRead for ScriptedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.steps.pop_front() {
                Some(Step::Data(mut data)) => {
                    let n = data.len().min(buf.remaining());
                    let rest = data.split_off(n);
                    buf.put_slice(&data);
                    if !rest.is_empty() {
                        self.steps.push_front(Step::Data(rest));
                    }
                    Poll::Ready(Ok(()))
                }
                Some(Step::Eof) | None => Poll::Ready(Ok(())),
                Some(Step::Fail(kind)) => Poll::Ready(Err(io::Error::new(kind, "scripted"))),
            }
        }
    }

    fn sample() -> (ChatMessage, Vec<u8>) {
        let msg = ChatMessage::chat("Silvermoon", "Lightbeam", "Wolverine");
        let bytes = encode(&msg).unwrap().to_vec();
        (msg, bytes)
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = HeaderRetry::default();
        assert_eq!(retry.backoff(0), Duration::from_secs(1));
        assert_eq!(retry.backoff(1), Duration::from_secs(2));
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_whole_message() {
        let (msg, bytes) = sample();
        let mut reader = ScriptedReader::new(vec![Step::Data(bytes.clone())]);

        let start = Instant::now();
        let data = read_message(&mut reader, &HeaderRetry::default())
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(data.len(), 33);
        assert_eq!(&data[..], &bytes[..]);
        assert_eq!(decode(&data).unwrap(), msg);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmented_header_is_reassembled() {
        let (msg, bytes) = sample();
        let mut reader = ScriptedReader::new(vec![
            Step::Data(bytes[..7].to_vec()),
            Step::Eof,
            Step::Data(bytes[7..15].to_vec()),
            Step::Eof,
            Step::Data(bytes[15..].to_vec()),
        ]);

        let start = Instant::now();
        let data = read_message(&mut reader, &HeaderRetry::default())
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(decode(&data).unwrap(), msg);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_fails_without_delay() {
        let mut reader = ScriptedReader::new(vec![Step::Eof]);

        let start = Instant::now();
        let err = read_message(&mut reader, &HeaderRetry::default())
            .await
            .unwrap_err();

        assert!(err.is_closed());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reads_exhaust_budget() {
        let (_, bytes) = sample();
        let mut reader = ScriptedReader::new(vec![
            Step::Data(bytes[..2].to_vec()),
            Step::Eof,
            Step::Data(bytes[2..4].to_vec()),
            Step::Eof,
            Step::Data(bytes[4..6].to_vec()),
            Step::Eof,
            Step::Data(bytes[6..].to_vec()),
        ]);

        let start = Instant::now();
        let err = read_message(&mut reader, &HeaderRetry::default())
            .await
            .unwrap_err();

        match err {
            ProtocolError::HeaderIncomplete { received, attempts } => {
                assert_eq!(received, 6);
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected HeaderIncomplete error, got {:?}", other),
        }
        // 1s + 2s + 4s
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ends_mid_header() {
        let (_, bytes) = sample();
        let mut reader = ScriptedReader::new(vec![Step::Data(bytes[..5].to_vec())]);

        let start = Instant::now();
        let err = read_message(&mut reader, &HeaderRetry::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProtocolError::HeaderIncomplete {
                received: 5,
                attempts: 2
            }
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_error_is_fatal() {
        let (_, bytes) = sample();
        let mut reader = ScriptedReader::new(vec![
            Step::Data(bytes[..4].to_vec()),
            Step::Fail(io::ErrorKind::BrokenPipe),
        ]);

        let start = Instant::now();
        let err = read_message(&mut reader, &HeaderRetry::default())
            .await
            .unwrap_err();

        match err {
            ProtocolError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("Expected Io error, got {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_reads_are_transparent() {
        let (msg, bytes) = sample();
        let mut reader = ScriptedReader::new(vec![
            Step::Data(bytes[..3].to_vec()),
            Step::Fail(io::ErrorKind::Interrupted),
            Step::Data(bytes[3..].to_vec()),
        ]);

        let data = read_message(&mut reader, &HeaderRetry::default())
            .await
            .unwrap();
        assert_eq!(decode(&data).unwrap(), msg);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_is_not_retried() {
        let (_, bytes) = sample();
        let mut reader = ScriptedReader::new(vec![
            Step::Data(bytes[..HEADER_LEN + 2].to_vec()),
            Step::Eof,
            Step::Data(bytes[HEADER_LEN + 2..].to_vec()),
        ]);

        let start = Instant::now();
        let err = read_message(&mut reader, &HeaderRetry::default())
            .await
            .unwrap_err();

        match err {
            ProtocolError::Payload(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("Expected Payload error, got {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_back_to_back_messages() {
        let first = ChatMessage::init("bill", "bill is online");
        let second = ChatMessage::chat("bill", "", "hello");
        let mut bytes = encode(&first).unwrap().to_vec();
        bytes.extend_from_slice(&encode(&second).unwrap());

        let mut reader = &bytes[..];
        let retry = HeaderRetry::default();
        assert_eq!(decode(&read_message(&mut reader, &retry).await.unwrap()).unwrap(), first);
        assert_eq!(decode(&read_message(&mut reader, &retry).await.unwrap()).unwrap(), second);
        assert!(read_message(&mut reader, &retry).await.unwrap_err().is_closed());
    }
}
