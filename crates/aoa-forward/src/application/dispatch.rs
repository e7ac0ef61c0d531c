//! Inbound direction: one USB transfer in, one command acted on.
//!
//! # What the dispatcher does with each command
//!
//! | Command               | Effect                                                     |
//! |-----------------------|------------------------------------------------------------|
//! | `CONNECT_SOCKET`      | dial the forwarding port; on failure send DISCONNECT back  |
//! | `DISCONNECT_SOCKET`   | close that session's socket (unknown ids are ignored)      |
//! | `DATA_PACKET`         | write the bytes to that session's socket, fully            |
//! | `ACCESSORY_CONNECTED` | mark the app connected, adopt its forwarding port          |
//! | `CLOSE_ACCESSORY`     | end the session; teardown sends nothing more to the device |
//! | `CONNECTION_RESP`     | host-to-device only; logged and dropped                    |
//!
//! Malformed transfers never stop the session: too-short transfers, unknown
//! tags, and bad payloads are logged and dropped.  A header whose length field
//! disagrees with the transfer size is logged and still dispatched.

use std::sync::Arc;

use aoa_core::{decode_payload, split_frame, Message, SessionId};
use tracing::{debug, info, warn};

use super::session::{SessionChannel, SessionEnd, SessionState};
use crate::infrastructure::sockets::SocketRegistry;

pub struct CommandDispatcher {
    registry: Arc<SocketRegistry>,
    channel: Arc<SessionChannel>,
    state: Arc<SessionState>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<SocketRegistry>,
        channel: Arc<SessionChannel>,
        state: Arc<SessionState>,
    ) -> Self {
        Self {
            registry,
            channel,
            state,
        }
    }

    /// Parses one bulk-IN transfer and acts on it.
    pub async fn handle_transfer(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let (header, payload) = match split_frame(bytes) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("packet too small, dropping: {e}");
                return;
            }
        };
        if !header.matches_len(bytes.len()) {
            warn!(
                "length mismatch: header declares {} bytes, transfer has {}",
                header.length,
                bytes.len()
            );
        }

        let command = match header.command() {
            Ok(command) => command,
            Err(e) => {
                warn!("{e}, dropping");
                return;
            }
        };

        match decode_payload(command, payload) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => warn!("protocol violation in {command}: {e}"),
        }
    }

    /// Acts on one decoded message.
    pub async fn dispatch(&self, message: Message<'_>) {
        match message {
            Message::ConnectSocket { session_id } => self.connect(session_id).await,
            Message::DisconnectSocket { session_id } => {
                if !self.registry.disconnect(session_id) {
                    debug!("DISCONNECT_SOCKET for unknown session {session_id}");
                }
            }
            Message::Data { session_id, payload } => self.deliver(session_id, payload).await,
            Message::AccessoryConnected { port } => {
                info!("accessory app connected, forwarding to port {port}");
                self.state.set_app_connected(port);
            }
            Message::CloseAccessory => {
                info!("accessory app requested close");
                // The app is already gone; teardown must not send CLOSE back.
                self.state.take_app_connected();
                self.state.end(SessionEnd::CloseRequested);
            }
            Message::ConnectionResponse { session_id, .. } => {
                warn!("unexpected CONNECTION_RESP from device for session {session_id}");
            }
        }
    }

    async fn connect(&self, session_id: SessionId) {
        let port = self.state.forward_port();
        if let Err(e) = self.registry.connect(session_id, port).await {
            warn!("{e}");
            self.channel
                .send(&Message::DisconnectSocket { session_id })
                .await;
        }
    }

    async fn deliver(&self, session_id: SessionId, payload: &[u8]) {
        let Some(handle) = self.registry.lookup(session_id) else {
            debug!(
                "DATA_PACKET for unknown session {session_id}, dropping {} bytes",
                payload.len()
            );
            return;
        };

        if let Err(e) = handle.write_all(payload).await {
            warn!("session {session_id}: local write failed: {e}");
            if self.registry.disconnect_handle(&handle) {
                self.channel
                    .send(&Message::DisconnectSocket { session_id })
                    .await;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
