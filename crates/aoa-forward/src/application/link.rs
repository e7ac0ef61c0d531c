//! The USB link as the application layer sees it.
//!
//! Two traits hide the transport:
//!
//! - [`FrameSink`] – puts one complete frame on the bulk-OUT endpoint.  Any
//!   number of tasks may call it; implementations serialise the writes so two
//!   frames never interleave on the wire.
//! - [`InboundTransport`] – yields one bulk-IN transfer at a time.  Whether
//!   that is backed by a queue of asynchronous transfers or by a worker doing
//!   blocking reads is the implementation's business; the dispatcher only sees
//!   "next transfer, nothing yet, or the link is gone".
//!
//! Real implementations live in `infrastructure::usb`; in-memory ones for tests
//! live in `infrastructure::usb::mock`.

use std::sync::Arc;
use std::time::Duration;

use aoa_core::DeviceIdentity;
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a USB transfer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("device disconnected")]
    Disconnected,

    #[error("endpoint stalled")]
    Stall,

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("USB transfer failed: {0}")]
    Usb(String),

    /// The transport was shut down or its worker exited.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the link should be considered lost.
    ///
    /// Only a cancelled transfer is harmless.  Inbound read timeouts never get
    /// here (transports report them as "nothing yet"), so a timeout is always
    /// a stuck OUT endpoint, and a short write has already broken the framing.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Cancelled)
    }
}

/// Outbound half of the link.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Writes one complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the transfer fails or times out.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Inbound half of the link.
#[async_trait]
pub trait InboundTransport: Send {
    /// Waits for the next bulk-IN transfer.
    ///
    /// `Ok(None)` means nothing arrived within the transport's read timeout;
    /// callers simply ask again.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the transfer fails.
    async fn next_transfer(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Cancels outstanding transfers and stops any worker.
    async fn shutdown(&mut self);
}

/// Everything a session needs from a negotiated accessory.
///
/// Dropping the link releases the claimed interface and closes the device.
pub struct AccessoryLink {
    pub identity: DeviceIdentity,
    pub inbound: Box<dyn InboundTransport>,
    pub outbound: Arc<dyn FrameSink>,
}

impl std::fmt::Debug for AccessoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessoryLink")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
