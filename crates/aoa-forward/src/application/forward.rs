//! Outbound direction: bytes from local sockets become DATA frames.
//!
//! The forwarder waits on the registry for readable sockets, reads each one
//! into a scratch buffer whose first six bytes are reserved for the DATA
//! header, and sends the frame.  EOF or a read error closes the socket and
//! tells the device with DISCONNECT_SOCKET.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use aoa_core::protocol::{write_data_header, DATA_PREFIX_SIZE};
use aoa_core::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::session::SessionChannel;
use crate::infrastructure::sockets::{SocketHandle, SocketRegistry};

/// Scratch buffer size; one DATA frame carries at most this minus the prefix.
pub const READ_BUFFER_SIZE: usize = 8192;

pub struct SocketForwarder {
    registry: Arc<SocketRegistry>,
    channel: Arc<SessionChannel>,
    poll_timeout: Duration,
}

impl SocketForwarder {
    pub fn new(
        registry: Arc<SocketRegistry>,
        channel: Arc<SessionChannel>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            channel,
            poll_timeout,
        }
    }

    /// Forwards until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let ready = tokio::select! {
                _ = token.cancelled() => break,
                ready = self.registry.poll(self.poll_timeout) => ready,
            };
            for handle in ready {
                self.forward_one(&handle, &mut buf).await;
            }
        }
        debug!("socket forwarder stopped");
    }

    /// Reads once from `handle` and forwards what arrived.
    pub async fn forward_one(&self, handle: &SocketHandle, buf: &mut [u8]) {
        let session_id = handle.session_id();
        match handle.try_read(&mut buf[DATA_PREFIX_SIZE..]) {
            Ok(0) => self.close(handle, "peer closed").await,
            Ok(n) => match write_data_header(buf, session_id, n) {
                Ok(total) => {
                    trace!("session {session_id}: forwarding {n} bytes");
                    self.channel.send_frame(buf[..total].to_vec()).await;
                }
                Err(e) => warn!("session {session_id}: {e}"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.close(handle, &e.to_string()).await,
        }
    }

    async fn close(&self, handle: &SocketHandle, reason: &str) {
        let session_id = handle.session_id();
        if self.registry.disconnect_handle(handle) {
            info!("session {session_id}: {reason}, notifying device");
            self.channel
                .send(&Message::DisconnectSocket { session_id })
                .await;
        }
    }
}
