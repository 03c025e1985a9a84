//! Deadline-bounded read/write primitives.
//!
//! These are generic over any async byte stream so the blocking semantics
//! (all-or-nothing writes, distinct timeout/disconnect outcomes) are the same
//! for plaintext and TLS connections.

use std::io;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{Result, TransportError};

/// Read once, waiting at most `timeout`.
///
/// `Ok(0)` means the peer closed cleanly. An EOF without a TLS close_notify
/// counts as clean only when `tolerate_unclean_eof` is set.
pub async fn read_within<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
    tolerate_unclean_eof: bool,
) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if buf.is_empty() {
        return Err(TransportError::Unsupported("zero-length read"));
    }
    match tokio::time::timeout(timeout, reader.read(buf)).await {
        Err(_) => Err(TransportError::Timeout),
        Ok(result) => map_read(result, tolerate_unclean_eof),
    }
}

/// Poll a read exactly once. No data ready is reported as `Timeout`.
pub fn try_read<R>(reader: &mut R, buf: &mut [u8], tolerate_unclean_eof: bool) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if buf.is_empty() {
        return Err(TransportError::Unsupported("zero-length read"));
    }
    match reader.read(buf).now_or_never() {
        None => Err(TransportError::Timeout),
        Some(result) => map_read(result, tolerate_unclean_eof),
    }
}

fn map_read(result: io::Result<usize>, tolerate_unclean_eof: bool) -> Result<usize> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && tolerate_unclean_eof => Ok(0),
        Err(e) => Err(TransportError::from_stream_error(e)),
    }
}

/// Write all of `buf` and flush before `timeout` elapses.
///
/// Partial writes are resumed internally; the caller sees either the full
/// length or an error, never a partial count.
pub async fn write_fully<W>(writer: &mut W, buf: &[u8], timeout: Duration) -> Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut written = 0;

    while written < buf.len() {
        match tokio::time::timeout_at(deadline, writer.write(&buf[written..])).await {
            Err(_) => return Err(TransportError::Timeout),
            Ok(Ok(0)) => return Err(TransportError::Disconnect),
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(TransportError::from_stream_error(e)),
        }
    }

    match tokio::time::timeout_at(deadline, writer.flush()).await {
        Err(_) => Err(TransportError::Timeout),
        Ok(Err(e)) => Err(TransportError::from_stream_error(e)),
        Ok(Ok(())) => Ok(written),
    }
}

/// Poll a write exactly once and report how much was accepted (possibly 0).
pub fn try_write<W>(writer: &mut W, buf: &[u8]) -> Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match writer.write(buf).now_or_never() {
        None => Ok(0),
        Some(Ok(n)) => Ok(n),
        Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Some(Err(e)) => Err(TransportError::from_stream_error(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts at most `chunk` bytes per write call.
    struct Trickle {
        chunk: usize,
        sink: Vec<u8>,
        calls: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.chunk);
            self.calls += 1;
            self.sink.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn partial_writes_complete() {
        let mut trickle = Trickle { chunk: 3, sink: Vec::new(), calls: 0 };
        let payload: Vec<u8> = (0..100u8).collect();

        let n = write_fully(&mut trickle, &payload, Duration::from_secs(1)).await.unwrap();

        assert_eq!(n, payload.len());
        assert_eq!(trickle.sink, payload);
        assert_eq!(trickle.calls, 34);
    }

    #[tokio::test]
    async fn zero_length_write_is_disconnect() {
        let mut dead = Trickle { chunk: 0, sink: Vec::new(), calls: 0 };
        let err = write_fully(&mut dead, b"hello", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnect));
    }

    #[tokio::test]
    async fn small_pipe_write_succeeds_with_concurrent_reader() {
        let (mut tx, mut rx) = tokio::io::duplex(4);
        let payload = vec![7u8; 4096];
        let expected = payload.clone();

        let reader = tokio::spawn(async move {
            let mut got = vec![0u8; 4096];
            rx.read_exact(&mut got).await.unwrap();
            got
        });

        write_fully(&mut tx, &payload, Duration::from_secs(5)).await.unwrap();
        assert_eq!(reader.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn idle_read_times_out_near_deadline() {
        let (_tx, mut rx) = tokio::io::duplex(64);
        let mut buf = [0u8; 16];

        let start = std::time::Instant::now();
        let err = read_within(&mut rx, &mut buf, Duration::from_millis(100), false)
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, TransportError::Timeout));
        assert!(elapsed >= Duration::from_millis(90), "returned early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "returned late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn closed_peer_reads_zero() {
        let (tx, mut rx) = tokio::io::duplex(64);
        drop(tx);
        let mut buf = [0u8; 16];
        let n = read_within(&mut rx, &mut buf, Duration::from_millis(100), false).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn empty_buffer_is_rejected() {
        let (_tx, mut rx) = tokio::io::duplex(64);
        let err = read_within(&mut rx, &mut [], Duration::from_millis(10), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }

    #[tokio::test]
    async fn try_read_reports_timeout_when_idle() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let mut buf = [0u8; 8];
        assert!(matches!(try_read(&mut rx, &mut buf, false), Err(TransportError::Timeout)));

        tx.write_all(b"ping").await.unwrap();
        assert_eq!(try_read(&mut rx, &mut buf, false).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn unclean_eof_mapping() {
        let eof = || Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no close_notify"));
        assert_eq!(map_read(eof(), true).unwrap(), 0);
        assert!(matches!(map_read(eof(), false), Err(TransportError::Disconnect)));
    }
}
