//! End-to-end session tests over the in-memory USB link.
//!
//! The "device" side is an `mpsc` sender feeding a `ChannelTransport`; frames
//! the host sends land in a `RecordingSink`.  Local sockets are real loopback
//! listeners.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aoa_core::{encode_message, DeviceFilter, DeviceIdentity, Message};
use aoa_forward::application::link::AccessoryLink;
use aoa_forward::application::session::SessionEnd;
use aoa_forward::application::supervisor::{
    run_session, AcquireError, AttachWatcher, DeviceAcquirer, SessionSupervisor,
    SupervisorSettings,
};
use aoa_forward::infrastructure::sockets::RegistryConfig;
use aoa_forward::infrastructure::usb::mock::{channel_transport, ChannelTransport, RecordingSink};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ACCESSORY: DeviceIdentity = DeviceIdentity::new(0x18D1, 0x2D01);
const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ───────────────────────────────────────────────────────────────────

fn settings(default_port: u16) -> SupervisorSettings {
    SupervisorSettings {
        default_port,
        registry: RegistryConfig {
            host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(2),
        },
        poll_timeout: Duration::from_millis(20),
        grace_period: Duration::from_millis(10),
        retry_interval: Duration::from_millis(20),
    }
}

fn link(inbound: ChannelTransport, sink: &Arc<RecordingSink>) -> AccessoryLink {
    AccessoryLink {
        identity: ACCESSORY,
        inbound: Box::new(inbound),
        outbound: sink.clone(),
    }
}

fn frame(msg: Message<'_>) -> Result<Vec<u8>, aoa_forward::application::link::TransportError> {
    Ok(encode_message(&msg).unwrap())
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Hands out prepared links in order, then reports "no device".
struct FakeAcquirer {
    links: Mutex<VecDeque<AccessoryLink>>,
    filters: Arc<Mutex<Vec<DeviceFilter>>>,
}

impl FakeAcquirer {
    fn new(links: Vec<AccessoryLink>) -> (Self, Arc<Mutex<Vec<DeviceFilter>>>) {
        let filters = Arc::new(Mutex::new(Vec::new()));
        let acquirer = Self {
            links: Mutex::new(links.into()),
            filters: Arc::clone(&filters),
        };
        (acquirer, filters)
    }
}

#[async_trait]
impl DeviceAcquirer for FakeAcquirer {
    async fn acquire(&self, filter: DeviceFilter) -> Result<AccessoryLink, AcquireError> {
        self.filters.lock().unwrap().push(filter);
        self.links
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| "no device attached".into())
    }
}

/// Replays attach events pushed by the test; a `None` ends the stream.
struct FakeWatcher {
    rx: mpsc::UnboundedReceiver<Option<DeviceIdentity>>,
}

#[async_trait]
impl AttachWatcher for FakeWatcher {
    async fn wait_for_attach(&mut self) -> Option<DeviceIdentity> {
        self.rx.recv().await.flatten()
    }
}

// ── Single session ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_accessory_tears_down_without_reply() {
    // Arrange
    let sink = Arc::new(RecordingSink::new());
    let (device, inbound) = channel_transport(16);
    let released = inbound.shutdown_flag();
    let shutdown = CancellationToken::new();
    let session = tokio::spawn({
        let link = link(inbound, &sink);
        let shutdown = shutdown.clone();
        async move { run_session(link, &settings(1), &shutdown).await }
    });

    // Act
    device.send(frame(Message::AccessoryConnected { port: 8000 })).await.unwrap();
    device.send(frame(Message::CloseAccessory)).await.unwrap();

    // Assert
    let end = tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
    assert_eq!(end, SessionEnd::CloseRequested);
    assert!(sink.frames().is_empty(), "nothing may follow the device's close");
    assert!(released.load(Ordering::SeqCst));
    assert!(!shutdown.is_cancelled(), "a session end is not a process shutdown");
}

#[tokio::test]
async fn test_interleaved_sessions_reach_their_own_sockets() {
    // Arrange
    let (listener, port) = listener().await;
    let sink = Arc::new(RecordingSink::new());
    let (device, inbound) = channel_transport(16);
    let shutdown = CancellationToken::new();
    let session = tokio::spawn({
        let link = link(inbound, &sink);
        let shutdown = shutdown.clone();
        async move { run_session(link, &settings(port), &shutdown).await }
    });

    device.send(frame(Message::ConnectSocket { session_id: 1 })).await.unwrap();
    let (mut first, _) = listener.accept().await.unwrap();
    device.send(frame(Message::ConnectSocket { session_id: 2 })).await.unwrap();
    let (mut second, _) = listener.accept().await.unwrap();

    // Act: device to host, interleaved
    device
        .send(frame(Message::Data { session_id: 2, payload: b"two" }))
        .await
        .unwrap();
    device
        .send(frame(Message::Data { session_id: 1, payload: b"one" }))
        .await
        .unwrap();

    // Assert
    let mut buf = [0u8; 3];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"one");
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");

    // Act: host to device
    second.write_all(b"back").await.unwrap();

    // Assert
    let frames = sink.wait_for_frames(1, WAIT).await;
    assert_eq!(
        frames,
        vec![vec![0x03, 0x01, 0x00, 0x0A, 0x00, 0x02, b'b', b'a', b'c', b'k']]
    );

    shutdown.cancel();
    let end = tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
    assert_eq!(end, SessionEnd::Shutdown);
}

#[tokio::test]
async fn test_local_close_is_reported_to_the_device() {
    // Arrange
    let (listener, port) = listener().await;
    let sink = Arc::new(RecordingSink::new());
    let (device, inbound) = channel_transport(16);
    let shutdown = CancellationToken::new();
    let session = tokio::spawn({
        let link = link(inbound, &sink);
        let shutdown = shutdown.clone();
        async move { run_session(link, &settings(port), &shutdown).await }
    });
    device.send(frame(Message::ConnectSocket { session_id: 9 })).await.unwrap();
    let (peer, _) = listener.accept().await.unwrap();

    // Act
    drop(peer);

    // Assert
    let frames = sink.wait_for_frames(1, WAIT).await;
    assert_eq!(frames, vec![vec![0x02, 0x01, 0x00, 0x06, 0x00, 0x09]]);

    shutdown.cancel();
    tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_transport_loss_closes_every_forwarded_socket() {
    // Arrange
    let (listener, port) = listener().await;
    let sink = Arc::new(RecordingSink::new());
    let (device, inbound) = channel_transport(16);
    let shutdown = CancellationToken::new();
    let session = tokio::spawn({
        let link = link(inbound, &sink);
        let shutdown = shutdown.clone();
        async move { run_session(link, &settings(port), &shutdown).await }
    });
    device.send(frame(Message::ConnectSocket { session_id: 4 })).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    // Act: the device disappears
    drop(device);

    // Assert
    let end = tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
    assert_eq!(end, SessionEnd::TransportLost);
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0, "socket must be closed");
    assert!(sink.frames().is_empty());
}

#[tokio::test]
async fn test_shutdown_tells_an_announced_app_to_exit() {
    // Arrange
    let (listener, port) = listener().await;
    let sink = Arc::new(RecordingSink::new());
    let (device, inbound) = channel_transport(16);
    let shutdown = CancellationToken::new();
    let session = tokio::spawn({
        let link = link(inbound, &sink);
        let shutdown = shutdown.clone();
        async move { run_session(link, &settings(1), &shutdown).await }
    });
    device.send(frame(Message::AccessoryConnected { port })).await.unwrap();
    // Dialling the announced port proves the announcement was handled.
    device.send(frame(Message::ConnectSocket { session_id: 1 })).await.unwrap();
    let _peer = listener.accept().await.unwrap();

    // Act
    shutdown.cancel();

    // Assert
    let end = tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
    assert_eq!(end, SessionEnd::Shutdown);
    assert_eq!(sink.frames(), vec![vec![0x05, 0x0F, 0x00, 0x04]]);
}

#[tokio::test]
async fn test_frames_keep_flowing_until_the_shutdown_grace_period_ends() {
    // Arrange
    let (listener, port) = listener().await;
    let sink = Arc::new(RecordingSink::new());
    let (device, inbound) = channel_transport(16);
    let shutdown = CancellationToken::new();
    let session = tokio::spawn({
        let link = link(inbound, &sink);
        let shutdown = shutdown.clone();
        let settings = SupervisorSettings {
            grace_period: Duration::from_millis(500),
            ..settings(1)
        };
        async move { run_session(link, &settings, &shutdown).await }
    });
    device.send(frame(Message::AccessoryConnected { port })).await.unwrap();
    device.send(frame(Message::ConnectSocket { session_id: 1 })).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    // Act: shut down, then exchange data inside the grace period
    shutdown.cancel();
    let close = sink.wait_for_frames(1, WAIT).await;
    assert_eq!(close, vec![vec![0x05, 0x0F, 0x00, 0x04]]);

    device
        .send(frame(Message::Data { session_id: 1, payload: b"tail" }))
        .await
        .unwrap();
    let mut tail = [0u8; 4];
    tokio::time::timeout(WAIT, peer.read_exact(&mut tail))
        .await
        .unwrap()
        .unwrap();
    peer.write_all(b"up").await.unwrap();
    let frames = sink.wait_for_frames(2, WAIT).await;
    let still_running = !session.is_finished();

    // Assert
    assert_eq!(&tail, b"tail");
    assert_eq!(frames[1], vec![0x03, 0x01, 0x00, 0x08, 0x00, 0x01, b'u', b'p']);
    assert!(still_running, "the session must outlive the exchange");

    let end = tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
    assert_eq!(end, SessionEnd::Shutdown);
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0, "socket closed after the grace period");
}

// ── Supervisor loop ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_supervisor_retries_after_failure_and_counts_sessions() {
    // Arrange: first attempt fails, second yields a session the device closes
    let sink = Arc::new(RecordingSink::new());
    let (device, inbound) = channel_transport(16);
    device.send(frame(Message::CloseAccessory)).await.unwrap();
    let (acquirer, filters) = FakeAcquirer::new(vec![link(inbound, &sink)]);
    let shutdown = CancellationToken::new();

    // Act
    let supervisor = tokio::spawn(
        SessionSupervisor::new(acquirer, DeviceFilter::AnyCompatible, settings(1))
            .run(shutdown.clone()),
    );
    wait_until(|| filters.lock().unwrap().len() >= 3).await;
    shutdown.cancel();

    // Assert
    let sessions = tokio::time::timeout(WAIT, supervisor).await.unwrap().unwrap();
    assert_eq!(sessions, 1);
    assert!(filters
        .lock()
        .unwrap()
        .iter()
        .all(|filter| *filter == DeviceFilter::AnyCompatible));
}

#[tokio::test]
async fn test_attach_event_narrows_the_next_attempt() {
    // Arrange
    let (acquirer, filters) = FakeAcquirer::new(Vec::new());
    let (attach, rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let mut retry = settings(1);
    retry.retry_interval = Duration::from_secs(60);
    let supervisor = tokio::spawn(
        SessionSupervisor::new(acquirer, DeviceFilter::AnyCompatible, retry)
            .with_watcher(Box::new(FakeWatcher { rx }))
            .run(shutdown.clone()),
    );
    wait_until(|| filters.lock().unwrap().len() == 1).await;

    // Act
    attach.send(Some(DeviceIdentity::new(0x1234, 0x0001))).unwrap();
    attach.send(Some(DeviceIdentity::new(0x04E8, 0x6860))).unwrap();
    wait_until(|| filters.lock().unwrap().len() == 2).await;
    shutdown.cancel();

    // Assert
    assert_eq!(tokio::time::timeout(WAIT, supervisor).await.unwrap().unwrap(), 0);
    assert_eq!(
        *filters.lock().unwrap(),
        vec![
            DeviceFilter::AnyCompatible,
            DeviceFilter::Exact(DeviceIdentity::new(0x04E8, 0x6860)),
        ]
    );
}

#[tokio::test]
async fn test_watcher_end_falls_back_to_fixed_interval() {
    // Arrange
    let (acquirer, filters) = FakeAcquirer::new(Vec::new());
    let (attach, rx) = mpsc::unbounded_channel();
    attach.send(None).unwrap();
    let shutdown = CancellationToken::new();

    // Act
    let supervisor = tokio::spawn(
        SessionSupervisor::new(acquirer, DeviceFilter::AnyCompatible, settings(1))
            .with_watcher(Box::new(FakeWatcher { rx }))
            .run(shutdown.clone()),
    );
    wait_until(|| filters.lock().unwrap().len() >= 3).await;
    shutdown.cancel();

    // Assert
    tokio::time::timeout(WAIT, supervisor).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_an_idle_supervisor() {
    let (acquirer, _filters) = FakeAcquirer::new(Vec::new());
    let mut idle = settings(1);
    idle.retry_interval = Duration::from_secs(60);
    let shutdown = CancellationToken::new();
    let supervisor = tokio::spawn(
        SessionSupervisor::new(acquirer, DeviceFilter::AnyCompatible, idle).run(shutdown.clone()),
    );

    shutdown.cancel();

    assert_eq!(tokio::time::timeout(WAIT, supervisor).await.unwrap().unwrap(), 0);
}
