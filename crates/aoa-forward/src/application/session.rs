//! Shared state of one accessory session and the gated outbound path.
//!
//! [`SessionState`] is created by the supervisor for each session and shared
//! (behind an `Arc`) by the dispatcher, the forwarder, and the teardown path.
//! It replaces any process-wide "running" flag: every duty watches the
//! session's [`CancellationToken`].  The supervisor cancels it on process
//! shutdown only after the grace period, so the token is not a child of the
//! shutdown token.
//!
//! [`SessionChannel`] is the only way frames reach the [`FrameSink`].  It
//! refuses new frames once the session leaves `Active`, with one exception:
//! the CLOSE_ACCESSORY notice sent by [`SessionChannel::signal_app_exit`]
//! during teardown.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aoa_core::{encode_message, Message, SessionEvent, SessionPhase, TransitionError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::link::{FrameSink, TransportError};

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The device sent CLOSE_ACCESSORY.
    CloseRequested,
    /// A fatal transfer error or device detach.
    TransportLost,
    /// The process is shutting down.
    Shutdown,
}

impl SessionEnd {
    fn event(self) -> SessionEvent {
        match self {
            SessionEnd::CloseRequested => SessionEvent::CloseRequested,
            SessionEnd::TransportLost => SessionEvent::TransportLost,
            SessionEnd::Shutdown => SessionEvent::ShutdownRequested,
        }
    }
}

pub struct SessionState {
    phase: Mutex<SessionPhase>,
    end: Mutex<Option<SessionEnd>>,
    app_connected: AtomicBool,
    forward_port: AtomicU16,
    token: CancellationToken,
}

impl SessionState {
    /// Creates a `Negotiating` session that dials `default_port` until the
    /// device announces its own.
    pub fn new(default_port: u16, token: CancellationToken) -> Self {
        Self {
            phase: Mutex::new(SessionPhase::Negotiating),
            end: Mutex::new(None),
            app_connected: AtomicBool::new(false),
            forward_port: AtomicU16::new(default_port),
            token,
        }
    }

    fn phase_guard(&self) -> MutexGuard<'_, SessionPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase_guard()
    }

    /// Applies a lifecycle event.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the event is invalid in the current phase;
    /// the phase is left unchanged.
    pub fn apply(&self, event: SessionEvent) -> Result<SessionPhase, TransitionError> {
        let mut phase = self.phase_guard();
        let next = phase.apply(event)?;
        if next != *phase {
            debug!("session {} -> {next}", *phase);
        }
        *phase = next;
        Ok(next)
    }

    pub fn accepts_frames(&self) -> bool {
        self.phase().accepts_frames()
    }

    /// Records the device app as running and adopts its forwarding port.
    pub fn set_app_connected(&self, port: u16) {
        self.forward_port.store(port, Ordering::SeqCst);
        self.app_connected.store(true, Ordering::SeqCst);
    }

    pub fn app_connected(&self) -> bool {
        self.app_connected.load(Ordering::SeqCst)
    }

    /// Clears the app-connected flag, returning whether it was set.
    pub fn take_app_connected(&self) -> bool {
        self.app_connected.swap(false, Ordering::SeqCst)
    }

    pub fn forward_port(&self) -> u16 {
        self.forward_port.load(Ordering::SeqCst)
    }

    /// Stops the session.  The first reason recorded wins; later calls only
    /// re-cancel the (already cancelled) token.
    pub fn end(&self, reason: SessionEnd) {
        {
            let mut end = self.end.lock().unwrap_or_else(PoisonError::into_inner);
            if end.is_none() {
                *end = Some(reason);
                if let Err(e) = self.apply(reason.event()) {
                    debug!("{e}");
                }
            }
        }
        self.token.cancel();
    }

    pub fn end_reason(&self) -> Option<SessionEnd> {
        *self.end.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// The gated outbound frame path of one session.
pub struct SessionChannel {
    sink: Arc<dyn FrameSink>,
    state: Arc<SessionState>,
}

impl SessionChannel {
    pub fn new(sink: Arc<dyn FrameSink>, state: Arc<SessionState>) -> Self {
        Self { sink, state }
    }

    /// Encodes and sends `msg` if the session is `Active`.
    ///
    /// Returns whether the frame was written.
    pub async fn send(&self, msg: &Message<'_>) -> bool {
        match encode_message(msg) {
            Ok(frame) => self.send_frame(frame).await,
            Err(e) => {
                warn!("could not encode {}: {e}", msg.command());
                false
            }
        }
    }

    /// Sends an already encoded frame if the session is `Active`.
    pub async fn send_frame(&self, frame: Vec<u8>) -> bool {
        if !self.state.accepts_frames() {
            debug!("session {}, dropping outbound frame", self.state.phase());
            return false;
        }
        self.deliver(frame).await
    }

    /// Tells the device app the host is going away, if it announced itself.
    ///
    /// Sent regardless of phase; clears `app_connected` so it is sent at most
    /// once per session.
    pub async fn signal_app_exit(&self) -> bool {
        if !self.state.take_app_connected() {
            return false;
        }
        info!("signalling accessory app exit");
        match encode_message(&Message::CloseAccessory) {
            Ok(frame) => self.deliver(frame).await,
            Err(e) => {
                warn!("could not encode CLOSE_ACCESSORY: {e}");
                false
            }
        }
    }

    async fn deliver(&self, frame: Vec<u8>) -> bool {
        match self.sink.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    fn report(&self, e: &TransportError) {
        if e.is_fatal() {
            error!("outbound transfer failed: {e}");
            self.state.end(SessionEnd::TransportLost);
        } else {
            warn!("outbound transfer failed: {e}");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
