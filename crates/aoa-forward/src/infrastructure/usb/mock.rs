//! In-memory USB link for tests.
//!
//! # Why a mock link?
//!
//! The real transports need an Android device attached in accessory mode.
//! These stand-ins let the dispatcher, forwarder, and supervisor be driven
//! from plain Tokio tests:
//!
//! - [`RecordingSink`] records every outbound frame in a `Mutex<Vec<...>>` so
//!   tests can assert on exactly what would have gone to the device.
//! - [`ChannelTransport`] yields inbound transfers that the test pushes
//!   through an `mpsc` channel.
//!
//! # Usage in tests
//!
//! ```ignore
//! let (device, inbound) = channel_transport(8);
//! let sink = Arc::new(RecordingSink::new());
//! let link = AccessoryLink { identity, inbound: Box::new(inbound), outbound: sink.clone() };
//!
//! device.send(Ok(encode_u16(Command::ConnectSocket, 1)?)).await?;
//! let frames = sink.wait_for_frames(1, Duration::from_secs(1)).await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::application::link::{FrameSink, InboundTransport, TransportError};

/// A frame sink that records frames instead of writing them.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Vec<u8>>>,
    /// When set, every `send` returns this error and records nothing.
    failure: Option<TransportError>,
    sent: Notify,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every write fails with `error`.
    pub fn failing(error: TransportError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// Snapshot of the frames recorded so far, in send order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits until at least `count` frames were recorded or `timeout` passes,
    /// then returns the snapshot.
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let wait = async {
            loop {
                let notified = self.sent.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.frames.lock().unwrap_or_else(PoisonError::into_inner).len() >= count {
                    return;
                }
                notified.await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.frames()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        self.sent.notify_waiters();
        Ok(())
    }
}

/// Test-side handle used to feed [`ChannelTransport`].
pub type DeviceSender = mpsc::Sender<Result<Vec<u8>, TransportError>>;

/// An inbound transport fed from an `mpsc` channel.
///
/// An idle channel yields `Ok(None)` after `idle_timeout`, matching the real
/// transports' read timeout.  Dropping every sender reads as the device
/// disappearing.
pub struct ChannelTransport {
    rx: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
    idle_timeout: Duration,
    shut_down: Arc<AtomicBool>,
}

impl ChannelTransport {
    /// Flag that flips to `true` once `shutdown` has been called.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shut_down)
    }
}

/// Creates a connected sender and transport pair.
pub fn channel_transport(capacity: usize) -> (DeviceSender, ChannelTransport) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let transport = ChannelTransport {
        rx,
        idle_timeout: Duration::from_millis(50),
        shut_down: Arc::new(AtomicBool::new(false)),
    };
    (tx, transport)
}

#[async_trait]
impl InboundTransport for ChannelTransport {
    async fn next_transfer(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(result)) => result.map(Some),
            Ok(None) => Err(TransportError::Disconnected),
        }
    }

    async fn shutdown(&mut self) {
        self.rx.close();
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
