//! Full-delivery writes over non-blocking sockets.
//!
//! A local socket may accept only part of a DATA payload per write.  The loop
//! here waits for writability and retries until every byte is delivered, so a
//! slow local service applies back-pressure instead of losing data.

use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

/// A local socket stopped accepting data.
#[derive(Debug, Error)]
pub enum SocketWriteBroken {
    /// The peer closed its receive side (a write returned zero bytes).
    #[error("peer closed the connection")]
    Closed,
    #[error("socket write failed: {0}")]
    Io(#[from] io::Error),
}

/// The two readiness-based write primitives `write_fully` needs.
#[async_trait]
pub trait NonBlockingWrite: Send + Sync {
    /// Waits until the socket may accept more bytes.
    async fn writable(&self) -> io::Result<()>;

    /// Writes as many bytes as the socket accepts right now.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl NonBlockingWrite for TcpStream {
    async fn writable(&self) -> io::Result<()> {
        TcpStream::writable(self).await
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// Writes all of `bytes`, waiting for writability between partial writes.
///
/// # Errors
///
/// Returns [`SocketWriteBroken`] if the socket is closed or fails; bytes
/// written before the failure are not rolled back.
pub async fn write_fully<W>(writer: &W, mut bytes: &[u8]) -> Result<(), SocketWriteBroken>
where
    W: NonBlockingWrite + ?Sized,
{
    while !bytes.is_empty() {
        writer.writable().await?;
        match writer.try_write(bytes) {
            Ok(0) => return Err(SocketWriteBroken::Closed),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => return Err(SocketWriteBroken::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Accepts one byte per call and reports `WouldBlock` on every other call.
    #[derive(Default)]
    struct TrickleWriter {
        written: Mutex<Vec<u8>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NonBlockingWrite for TrickleWriter {
        async fn writable(&self) -> io::Result<()> {
            tokio::task::yield_now().await;
            Ok(())
        }

        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.written.lock().unwrap().push(buf[0]);
            Ok(1)
        }
    }

    struct BrokenWriter(io::ErrorKind);

    #[async_trait]
    impl NonBlockingWrite for BrokenWriter {
        async fn writable(&self) -> io::Result<()> {
            Ok(())
        }

        fn try_write(&self, _buf: &[u8]) -> io::Result<usize> {
            Err(self.0.into())
        }
    }

    struct ClosedWriter;

    #[async_trait]
    impl NonBlockingWrite for ClosedWriter {
        async fn writable(&self) -> io::Result<()> {
            Ok(())
        }

        fn try_write(&self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_one_byte_partial_writes_deliver_whole_payload() {
        // Arrange
        let writer = TrickleWriter::default();
        let payload: Vec<u8> = (0u8..=255).collect();

        // Act
        let result = write_fully(&writer, &payload).await;

        // Assert
        tokio_test::assert_ok!(result);
        assert_eq!(*writer.written.lock().unwrap(), payload);
    }

    #[tokio::test]
    async fn test_empty_payload_writes_nothing() {
        let writer = TrickleWriter::default();
        write_fully(&writer, &[]).await.expect("empty write");
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_broken_pipe_is_reported() {
        let result = write_fully(&BrokenWriter(io::ErrorKind::BrokenPipe), b"x").await;
        assert!(matches!(result, Err(SocketWriteBroken::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[tokio::test]
    async fn test_zero_byte_write_means_closed() {
        let result = write_fully(&ClosedWriter, b"x").await;
        assert!(matches!(result, Err(SocketWriteBroken::Closed)));
    }
}
