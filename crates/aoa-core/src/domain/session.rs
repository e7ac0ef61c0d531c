//! Lifecycle of one accessory session.
//!
//! ```text
//!              Negotiated
//! Negotiating ───────────► Active
//!      │                     │  CloseRequested / TransportLost / ShutdownRequested
//!      │ (any stop event)    ▼
//!      └───────────────► Closing ──TeardownComplete──► Closed
//! ```
//!
//! Stop events are idempotent once the session is `Closing`, and a second
//! `TeardownComplete` on a `Closed` session is a no-op, so teardown can be
//! requested from several places without coordination.

use std::fmt;

use thiserror::Error;

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Negotiating,
    Active,
    Closing,
    Closed,
}

/// Inputs that move a session between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Accessory mode entered and both endpoints resolved.
    Negotiated,
    /// The device sent CLOSE_ACCESSORY.
    CloseRequested,
    /// A fatal transfer error or device detach.
    TransportLost,
    /// The process is shutting down.
    ShutdownRequested,
    /// Sockets closed and the USB interface released.
    TeardownComplete,
}

/// An event that is not valid in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition: {event:?} while {phase}")]
pub struct TransitionError {
    pub phase: SessionPhase,
    pub event: SessionEvent,
}

impl SessionEvent {
    fn is_stop(self) -> bool {
        matches!(
            self,
            SessionEvent::CloseRequested | SessionEvent::TransportLost | SessionEvent::ShutdownRequested
        )
    }
}

impl SessionPhase {
    /// Applies `event`, returning the next phase.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when `event` is not valid in this phase
    /// (e.g. `Negotiated` on an `Active` session, or skipping `Closing`).
    pub fn apply(self, event: SessionEvent) -> Result<SessionPhase, TransitionError> {
        use SessionEvent as E;
        use SessionPhase as P;

        match (self, event) {
            (P::Negotiating, E::Negotiated) => Ok(P::Active),
            (P::Negotiating | P::Active | P::Closing, e) if e.is_stop() => Ok(P::Closing),
            (P::Negotiating | P::Closing | P::Closed, E::TeardownComplete) => Ok(P::Closed),
            (phase, event) => Err(TransitionError { phase, event }),
        }
    }

    /// Only an `Active` session may put new frames on the wire.
    pub fn accepts_frames(self) -> bool {
        self == SessionPhase::Active
    }

    pub fn is_terminal(self) -> bool {
        self == SessionPhase::Closed
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Negotiating => "negotiating",
            SessionPhase::Active => "active",
            SessionPhase::Closing => "closing",
            SessionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}
