//! The socket registry: every local TCP connection the device asked for.
//!
//! The registry is the only owner of forwarded sockets.  Other components get
//! a [`SocketHandle`] which can read and write but never close; closing goes
//! through [`SocketRegistry::disconnect`] (by session id) or
//! [`SocketRegistry::disconnect_handle`] (generation-checked).
//!
//! # Why generations?
//!
//! The device reuses session ids.  If the forwarder sees EOF on session 3 while
//! the dispatcher has already replaced session 3 with a fresh connection, a
//! plain "disconnect 3" would close the wrong socket.  Each entry records the
//! generation it was inserted with, and handle-based removal only succeeds if
//! the generation still matches.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use aoa_core::SessionId;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::write::{write_fully, SocketWriteBroken};

/// Opening a local connection for the device failed.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {session_id}: connect to {addr} failed: {source}")]
    ConnectFailure {
        session_id: SessionId,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("session {session_id}: connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        session_id: SessionId,
        addr: String,
        timeout: Duration,
    },
}

impl RegistryError {
    pub fn session_id(&self) -> SessionId {
        match self {
            RegistryError::ConnectFailure { session_id, .. }
            | RegistryError::ConnectTimeout { session_id, .. } => *session_id,
        }
    }
}

/// Result of a successful [`SocketRegistry::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// The session id was already live; the existing socket was kept.
    AlreadyConnected,
}

/// Where and how long to dial local connections.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub host: String,
    pub connect_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Non-owning access to one registered socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    session_id: SessionId,
    generation: u64,
    stream: Arc<TcpStream>,
}

impl SocketHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Reads whatever is available without waiting.
    ///
    /// `Ok(0)` means the peer closed; `WouldBlock` means the readiness was
    /// spurious.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    /// Delivers all of `bytes` to the local service.
    ///
    /// # Errors
    ///
    /// Returns [`SocketWriteBroken`] when the connection is closed or fails.
    pub async fn write_all(&self, bytes: &[u8]) -> Result<(), SocketWriteBroken> {
        write_fully(self.stream.as_ref(), bytes).await
    }
}

#[derive(Default)]
struct Entries {
    by_session: HashMap<SessionId, SocketHandle>,
    next_generation: u64,
}

/// Arena of forwarded sockets keyed by session id.
pub struct SocketRegistry {
    config: RegistryConfig,
    entries: Mutex<Entries>,
    changed: Notify,
}

impl SocketRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Entries::default()),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a connection to `host:port` and registers it under `session_id`.
    ///
    /// A session id that is already live is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the connection cannot be established within
    /// the configured timeout.  Nothing is registered in that case.
    pub async fn connect(
        &self,
        session_id: SessionId,
        port: u16,
    ) -> Result<ConnectOutcome, RegistryError> {
        if self.contains(session_id) {
            debug!("session {session_id}: already connected, keeping existing socket");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let addr = format!("{}:{port}", self.config.host);
        let timeout = self.config.connect_timeout;
        let stream = match tokio::time::timeout(
            timeout,
            TcpStream::connect((self.config.host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(RegistryError::ConnectFailure { session_id, addr, source })
            }
            Err(_) => return Err(RegistryError::ConnectTimeout { session_id, addr, timeout }),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("session {session_id}: could not set TCP_NODELAY: {e}");
        }

        {
            let mut entries = self.lock();
            if entries.by_session.contains_key(&session_id) {
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            let generation = entries.next_generation;
            entries.next_generation += 1;
            entries.by_session.insert(
                session_id,
                SocketHandle {
                    session_id,
                    generation,
                    stream: Arc::new(stream),
                },
            );
        }
        self.changed.notify_waiters();
        info!("session {session_id}: connected to {addr}");
        Ok(ConnectOutcome::Connected)
    }

    /// Removes and closes the socket for `session_id`.
    ///
    /// Returns `false` if no such session was registered.
    pub fn disconnect(&self, session_id: SessionId) -> bool {
        let removed = self.lock().by_session.remove(&session_id).is_some();
        if removed {
            self.changed.notify_waiters();
            info!("session {session_id}: disconnected");
        }
        removed
    }

    /// Removes `handle`'s socket only if it is still the registered one.
    pub fn disconnect_handle(&self, handle: &SocketHandle) -> bool {
        let removed = {
            let mut entries = self.lock();
            match entries.by_session.get(&handle.session_id) {
                Some(current) if current.generation == handle.generation => {
                    entries.by_session.remove(&handle.session_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.changed.notify_waiters();
            info!("session {}: disconnected", handle.session_id);
        }
        removed
    }

    pub fn lookup(&self, session_id: SessionId) -> Option<SocketHandle> {
        self.lock().by_session.get(&session_id).cloned()
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.lock().by_session.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every registered socket, returning how many there were.
    pub fn close_all(&self) -> usize {
        let drained: Vec<SocketHandle> = self.lock().by_session.drain().map(|(_, h)| h).collect();
        if !drained.is_empty() {
            self.changed.notify_waiters();
            info!("closed {} forwarded socket(s)", drained.len());
        }
        drained.len()
    }

    /// Waits up to `timeout` for registered sockets to become readable.
    ///
    /// Returns every socket that is readable once the first one is, or an
    /// empty list on timeout.  With nothing registered this parks until a
    /// socket is added or the timeout elapses; it never spins.
    pub async fn poll(&self, timeout: Duration) -> Vec<SocketHandle> {
        tokio::time::timeout(timeout, self.wait_readable())
            .await
            .unwrap_or_default()
    }

    async fn wait_readable(&self) -> Vec<SocketHandle> {
        loop {
            // Registered before the snapshot so a concurrent insert is not missed.
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let snapshot: Vec<SocketHandle> = self.lock().by_session.values().cloned().collect();
            if snapshot.is_empty() {
                changed.await;
                continue;
            }

            let mut pending: FuturesUnordered<_> = snapshot
                .into_iter()
                .map(|handle| async move {
                    // A readiness error resurfaces on the read that follows.
                    let _ = handle.stream.readable().await;
                    handle
                })
                .collect();

            tokio::select! {
                _ = &mut changed => continue,
                Some(first) = pending.next() => {
                    let mut ready = vec![first];
                    while let Some(Some(handle)) = pending.next().now_or_never() {
                        ready.push(handle);
                    }
                    return ready;
                }
            }
        }
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn registry() -> SocketRegistry {
        SocketRegistry::new(RegistryConfig {
            host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn test_connect_then_disconnect_leaves_registry_empty() {
        // Arrange
        let (listener, port) = listener().await;
        let reg = registry();

        // Act
        let outcome = reg.connect(7, port).await.expect("connect");
        let _accepted = listener.accept().await.unwrap();
        let removed = reg.disconnect(7);

        // Assert
        assert_eq!(outcome, ConnectOutcome::Connected);
        assert!(removed);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_a_no_op() {
        let (_listener, port) = listener().await;
        let reg = registry();
        reg.connect(1, port).await.expect("connect");

        assert!(reg.disconnect(1));
        assert!(!reg.disconnect(1));
        assert!(!reg.disconnect(99));
    }

    #[tokio::test]
    async fn test_duplicate_connect_keeps_existing_socket() {
        // Arrange
        let (listener, port) = listener().await;
        let reg = registry();
        reg.connect(4, port).await.expect("first connect");
        let first = reg.lookup(4).expect("registered");

        // Act
        let outcome = reg.connect(4, port).await.expect("second connect");

        // Assert
        assert_eq!(outcome, ConnectOutcome::AlreadyConnected);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup(4).unwrap().generation, first.generation);
        drop(listener);
    }

    #[tokio::test]
    async fn test_connect_refused_registers_nothing() {
        // Arrange: bind then drop so the port is closed.
        let (listener, port) = listener().await;
        drop(listener);
        let reg = registry();

        // Act
        let err = reg.connect(7, port).await.expect_err("refused");

        // Assert
        assert_eq!(err.session_id(), 7);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_close_reused_session_id() {
        // Arrange
        let (_listener, port) = listener().await;
        let reg = registry();
        reg.connect(3, port).await.expect("connect");
        let stale = reg.lookup(3).unwrap();
        reg.disconnect(3);
        reg.connect(3, port).await.expect("reconnect");

        // Act
        let removed = reg.disconnect_handle(&stale);

        // Assert
        assert!(!removed);
        assert!(reg.contains(3));
    }

    #[tokio::test]
    async fn test_poll_reports_readable_socket() {
        // Arrange
        let (listener, port) = listener().await;
        let reg = registry();
        reg.connect(5, port).await.expect("connect");
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"ping").await.unwrap();

        // Act
        let ready = reg.poll(Duration::from_secs(2)).await;

        // Assert
        assert_eq!(ready.len(), 1);
        let mut buf = [0u8; 16];
        let n = ready[0].try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_poll_with_no_sockets_times_out_empty() {
        let reg = registry();
        let ready = reg.poll(Duration::from_millis(20)).await;
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn test_write_all_reaches_local_peer() {
        // Arrange
        let (listener, port) = listener().await;
        let reg = registry();
        reg.connect(2, port).await.expect("connect");
        let (mut peer, _) = listener.accept().await.unwrap();

        // Act
        reg.lookup(2).unwrap().write_all(b"hello").await.expect("write");

        // Assert
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_close_all_returns_count() {
        let (_listener, port) = listener().await;
        let reg = registry();
        reg.connect(1, port).await.expect("connect");
        reg.connect(2, port).await.expect("connect");

        assert_eq!(reg.close_all(), 2);
        assert!(reg.is_empty());
        assert_eq!(reg.close_all(), 0);
    }
}
