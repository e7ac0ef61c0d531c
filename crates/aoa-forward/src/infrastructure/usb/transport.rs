//! Bulk transfers over the claimed accessory interface.
//!
//! Outbound frames go through [`UsbFrameWriter`], which holds an async mutex
//! for the duration of each transfer so frames from the dispatcher and the
//! forwarder never interleave.
//!
//! Inbound transfers come from one of two strategies, chosen in config:
//!
//! - [`QueuedBulkReader`] keeps `queue_depth` bulk-IN requests outstanding
//!   and hands back completions in order.
//! - [`ThreadedBulkReader`] runs a worker on the blocking pool that keeps one
//!   read outstanding and passes results over a channel.
//!
//! Both report "nothing yet" as `Ok(None)` and only surface real failures.

use std::time::Duration;

use async_trait::async_trait;
use nusb::transfer::{Completion, Queue, RequestBuffer, TransferError};
use nusb::Interface;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::negotiator::Endpoints;
use crate::application::link::{FrameSink, InboundTransport, TransportError};
use crate::infrastructure::storage::config::{InboundStrategy, TransportConfig};

impl From<TransferError> for TransportError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Cancelled => TransportError::Cancelled,
            TransferError::Stall => TransportError::Stall,
            TransferError::Disconnected => TransportError::Disconnected,
            other => TransportError::Usb(other.to_string()),
        }
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Writes frames to the bulk-OUT endpoint, one at a time.
pub struct UsbFrameWriter {
    interface: Interface,
    endpoint: u8,
    max_packet_size: usize,
    timeout: Duration,
    write_lock: Mutex<()>,
}

impl UsbFrameWriter {
    pub fn new(interface: Interface, endpoints: Endpoints, timeout: Duration) -> Self {
        Self {
            interface,
            endpoint: endpoints.bulk_out,
            max_packet_size: endpoints.max_packet_size,
            timeout,
            write_lock: Mutex::new(()),
        }
    }

    async fn bulk_out(&self, data: Vec<u8>) -> Result<usize, TransportError> {
        let completion = tokio::time::timeout(self.timeout, self.interface.bulk_out(self.endpoint, data))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?;
        completion.status?;
        Ok(completion.data.actual_length())
    }
}

#[async_trait]
impl FrameSink for UsbFrameWriter {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let _guard = self.write_lock.lock().await;
        let expected = frame.len();
        let written = self.bulk_out(frame).await?;
        if written != expected {
            return Err(TransportError::ShortWrite { written, expected });
        }
        // A frame filling whole packets needs a zero-length packet to end the
        // device's read.
        if needs_zero_length_packet(expected, self.max_packet_size) {
            trace!("terminating {expected}-byte frame with a zero-length packet");
            self.bulk_out(Vec::new()).await?;
        }
        Ok(())
    }
}

fn needs_zero_length_packet(len: usize, max_packet_size: usize) -> bool {
    max_packet_size > 0 && len > 0 && len % max_packet_size == 0
}

// ── Inbound: queued asynchronous transfers ────────────────────────────────────

pub struct QueuedBulkReader {
    queue: Queue<RequestBuffer>,
    transfer_size: usize,
    read_timeout: Duration,
}

impl QueuedBulkReader {
    pub fn new(interface: &Interface, endpoint: u8, config: &TransportConfig) -> Self {
        let mut queue = interface.bulk_in_queue(endpoint);
        for _ in 0..config.queue_depth.max(1) {
            queue.submit(RequestBuffer::new(config.transfer_size));
        }
        Self {
            queue,
            transfer_size: config.transfer_size,
            read_timeout: config.read_timeout(),
        }
    }
}

#[async_trait]
impl InboundTransport for QueuedBulkReader {
    async fn next_transfer(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Ok(completion) = tokio::time::timeout(self.read_timeout, self.queue.next_complete()).await
        else {
            return Ok(None);
        };
        // Keep the queue full whatever the outcome.
        self.queue.submit(RequestBuffer::new(self.transfer_size));
        match completion.status {
            Ok(()) => Ok(Some(completion.data)),
            Err(TransferError::Cancelled) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn shutdown(&mut self) {
        self.queue.cancel_all();
        let drain = async {
            while self.queue.pending() > 0 {
                let _ = self.queue.next_complete().await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), drain).await.is_err() {
            warn!("bulk-IN transfers did not finish cancelling");
        }
    }
}

// ── Inbound: dedicated blocking-read worker ───────────────────────────────────

type TransferResult = Result<Vec<u8>, TransportError>;

pub struct ThreadedBulkReader {
    rx: mpsc::Receiver<TransferResult>,
    stop: CancellationToken,
    worker: Option<JoinHandle<()>>,
    read_timeout: Duration,
}

impl ThreadedBulkReader {
    /// Starts the worker.  Must be called from within a Tokio runtime.
    pub fn spawn(interface: Interface, endpoint: u8, config: &TransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let stop = CancellationToken::new();
        let worker = tokio::task::spawn_blocking({
            let runtime = tokio::runtime::Handle::current();
            let stop = stop.clone();
            let transfer_size = config.transfer_size;
            let read_timeout = config.read_timeout();
            move || {
                let queue = interface.bulk_in_queue(endpoint);
                read_worker(runtime, queue, transfer_size, read_timeout, tx, stop)
            }
        });
        Self {
            rx,
            stop,
            worker: Some(worker),
            read_timeout: config.read_timeout(),
        }
    }
}

/// The worker's view of a bulk-IN endpoint.
///
/// `next_complete` must be cancel-safe: a transfer that finishes after the
/// caller gave up waiting is returned by the next call.
trait CompletionSource {
    fn submit(&mut self, transfer_size: usize);
    async fn next_complete(&mut self) -> Completion<Vec<u8>>;
    fn pending(&self) -> usize;
    fn cancel_all(&mut self);
}

impl CompletionSource for Queue<RequestBuffer> {
    fn submit(&mut self, transfer_size: usize) {
        Queue::submit(self, RequestBuffer::new(transfer_size));
    }

    async fn next_complete(&mut self) -> Completion<Vec<u8>> {
        Queue::next_complete(self).await
    }

    fn pending(&self) -> usize {
        Queue::pending(self)
    }

    fn cancel_all(&mut self) {
        Queue::cancel_all(self);
    }
}

fn read_worker(
    runtime: tokio::runtime::Handle,
    mut source: impl CompletionSource,
    transfer_size: usize,
    read_timeout: Duration,
    tx: mpsc::Sender<TransferResult>,
    stop: CancellationToken,
) {
    source.submit(transfer_size);
    while !stop.is_cancelled() {
        // A timed-out wait leaves the request queued.
        let Ok(completion) =
            runtime.block_on(tokio::time::timeout(read_timeout, source.next_complete()))
        else {
            continue;
        };
        source.submit(transfer_size);
        let result = match completion.status {
            Ok(()) => Ok(completion.data),
            Err(TransferError::Cancelled) => continue,
            Err(e) => Err(TransportError::from(e)),
        };
        let fatal = result.is_err();
        if tx.blocking_send(result).is_err() || fatal {
            break;
        }
    }

    source.cancel_all();
    let drain = async {
        while source.pending() > 0 {
            let _ = source.next_complete().await;
        }
    };
    if runtime.block_on(tokio::time::timeout(Duration::from_secs(1), drain)).is_err() {
        warn!("bulk-IN worker left transfers pending");
    }
    debug!("bulk-IN worker stopped");
}

#[async_trait]
impl InboundTransport for ThreadedBulkReader {
    async fn next_transfer(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.recv().await {
            Some(result) => result.map(Some),
            None => Err(TransportError::Closed),
        }
    }

    async fn shutdown(&mut self) {
        self.stop.cancel();
        self.rx.close();
        if let Some(worker) = self.worker.take() {
            let grace = self.read_timeout + Duration::from_secs(1);
            if tokio::time::timeout(grace, worker).await.is_err() {
                warn!("bulk-IN worker did not stop within {grace:?}");
            }
        }
    }
}

/// Builds the inbound transport selected by `config.strategy`.
pub fn open_inbound(
    interface: &Interface,
    endpoint: u8,
    config: &TransportConfig,
) -> Box<dyn InboundTransport> {
    match config.strategy {
        InboundStrategy::Queued => Box::new(QueuedBulkReader::new(interface, endpoint, config)),
        InboundStrategy::Threaded => {
            Box::new(ThreadedBulkReader::spawn(interface.clone(), endpoint, config))
        }
    }
}
