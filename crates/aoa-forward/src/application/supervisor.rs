//! The session supervisor: acquire an accessory, run it, tear it down, retry.
//!
//! # Lifecycle of one session (for beginners)
//!
//! ```text
//! acquire(filter)                      -- negotiate + claim (blocking work)
//!  └─ run_session
//!       ├─ inbound duty:  transfer → CommandDispatcher
//!       ├─ outbound duty: readable socket → DATA frame
//!       └─ wait for the session token
//!            (CLOSE_ACCESSORY, transport loss, or process shutdown)
//!  └─ teardown
//!       1. CLOSE_ACCESSORY to the device if its app announced itself
//!       2. grace period, both duties still running
//!       3. session goes `Closing`, both duties stop
//!       4. close every forwarded socket
//!       5. shut down the inbound transport, release the interface
//! wait for retry                        -- hotplug attach, else fixed interval
//! ```
//!
//! A process shutdown enters teardown with the session still `Active`, so
//! frames already on their way in either direction are still handled during
//! the grace period.  CLOSE_ACCESSORY from the device and transport loss stop
//! the duties first; there is nobody left to exchange frames with.
//!
//! Each step is safe to reach with the previous ones partly done, so every
//! exit path funnels through the same teardown.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use aoa_core::{DeviceFilter, DeviceIdentity, SessionEvent};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::CommandDispatcher;
use super::forward::SocketForwarder;
use super::link::{AccessoryLink, InboundTransport};
use super::session::{SessionChannel, SessionEnd, SessionState};
use crate::infrastructure::sockets::{RegistryConfig, SocketRegistry};

/// Boxed error from a failed acquisition attempt.
pub type AcquireError = Box<dyn StdError + Send + Sync>;

/// Finds, negotiates, and claims an accessory.
#[async_trait]
pub trait DeviceAcquirer: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when no device could be brought into accessory mode.
    async fn acquire(&self, filter: DeviceFilter) -> Result<AccessoryLink, AcquireError>;
}

/// Source of device-attach notifications.
#[async_trait]
pub trait AttachWatcher: Send {
    /// Waits for the next attach.  `None` means notifications have stopped
    /// for good.
    async fn wait_for_attach(&mut self) -> Option<DeviceIdentity>;
}

/// Timing and addressing used by every session.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub default_port: u16,
    pub registry: RegistryConfig,
    pub poll_timeout: Duration,
    pub grace_period: Duration,
    pub retry_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            default_port: 8000,
            registry: RegistryConfig::default(),
            poll_timeout: Duration::from_millis(250),
            grace_period: Duration::from_secs(1),
            retry_interval: Duration::from_secs(5),
        }
    }
}

enum Retry {
    Now(DeviceFilter),
    Shutdown,
}

pub struct SessionSupervisor<A> {
    acquirer: A,
    watcher: Option<Box<dyn AttachWatcher>>,
    filter: DeviceFilter,
    settings: SupervisorSettings,
}

impl<A: DeviceAcquirer> SessionSupervisor<A> {
    pub fn new(acquirer: A, filter: DeviceFilter, settings: SupervisorSettings) -> Self {
        Self {
            acquirer,
            watcher: None,
            filter,
            settings,
        }
    }

    /// Waits for attach events between attempts instead of a fixed interval.
    pub fn with_watcher(mut self, watcher: Box<dyn AttachWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Runs sessions until `shutdown` is cancelled.
    ///
    /// Returns the number of sessions that reached `Active`.
    pub async fn run(mut self, shutdown: CancellationToken) -> usize {
        let mut sessions = 0;
        let mut filter = self.filter;

        while !shutdown.is_cancelled() {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                attempt = self.acquirer.acquire(filter) => attempt,
            };

            match attempt {
                Ok(link) => {
                    sessions += 1;
                    let end = run_session(link, &self.settings, &shutdown).await;
                    info!("session ended: {end:?}");
                }
                Err(e) => warn!("could not open accessory ({filter}): {e}"),
            }

            filter = match self.wait_for_retry(&shutdown).await {
                Retry::Now(next) => next,
                Retry::Shutdown => break,
            };
        }

        info!("supervisor stopped after {sessions} session(s)");
        sessions
    }

    async fn wait_for_retry(&mut self, shutdown: &CancellationToken) -> Retry {
        let mut watcher_stopped = false;
        if let Some(watcher) = self.watcher.as_mut() {
            loop {
                let attached = tokio::select! {
                    _ = shutdown.cancelled() => return Retry::Shutdown,
                    attached = watcher.wait_for_attach() => attached,
                };
                match attached {
                    Some(identity) if self.filter.accepts_attach(&identity) => {
                        info!("device {identity} attached");
                        return Retry::Now(self.filter.narrowed_to(identity));
                    }
                    Some(identity) => debug!("ignoring attach of {identity}"),
                    None => {
                        watcher_stopped = true;
                        break;
                    }
                }
            }
        }
        if watcher_stopped {
            warn!("hotplug notifications stopped, retrying every {:?}", self.settings.retry_interval);
            self.watcher = None;
        }

        tokio::select! {
            _ = shutdown.cancelled() => Retry::Shutdown,
            _ = tokio::time::sleep(self.settings.retry_interval) => Retry::Now(self.filter),
        }
    }
}

/// Runs one negotiated session to completion, including teardown.
///
/// Every exit path (CLOSE_ACCESSORY, transport loss, `shutdown`) goes
/// through the same teardown sequence.  On `shutdown` the session keeps
/// forwarding until the grace period after CLOSE_ACCESSORY has passed.
pub async fn run_session(
    link: AccessoryLink,
    settings: &SupervisorSettings,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let AccessoryLink {
        identity,
        inbound,
        outbound,
    } = link;

    // Not a child of `shutdown`: the duties must outlive the grace period.
    let token = CancellationToken::new();
    let state = Arc::new(SessionState::new(settings.default_port, token.clone()));
    if let Err(e) = state.apply(SessionEvent::Negotiated) {
        error!("{e}");
    }
    info!("accessory {identity} active");

    let registry = Arc::new(SocketRegistry::new(settings.registry.clone()));
    let channel = Arc::new(SessionChannel::new(outbound, Arc::clone(&state)));
    let dispatcher =
        CommandDispatcher::new(Arc::clone(&registry), Arc::clone(&channel), Arc::clone(&state));
    let forwarder = SocketForwarder::new(
        Arc::clone(&registry),
        Arc::clone(&channel),
        settings.poll_timeout,
    );

    let inbound_task = tokio::spawn(inbound_duty(inbound, dispatcher, Arc::clone(&state)));
    let outbound_token = token.clone();
    let outbound_task = tokio::spawn(async move { forwarder.run(outbound_token).await });

    let cause = tokio::select! {
        _ = token.cancelled() => state.end_reason().unwrap_or(SessionEnd::Shutdown),
        _ = shutdown.cancelled() => SessionEnd::Shutdown,
    };
    info!("tearing down accessory {identity} ({cause:?})");

    // 1. + 2.
    if channel.signal_app_exit().await {
        tokio::select! {
            _ = token.cancelled() => debug!("session stopped during the grace period"),
            _ = tokio::time::sleep(settings.grace_period) => {}
        }
    }

    // 3.
    state.end(cause);
    let reason = state.end_reason().unwrap_or(cause);
    if let Err(e) = outbound_task.await {
        error!("outbound duty failed: {e}");
    }
    let inbound = match inbound_task.await {
        Ok(inbound) => Some(inbound),
        Err(e) => {
            error!("inbound duty failed: {e}");
            None
        }
    };

    // 4.
    registry.close_all();

    // 5.
    if let Some(mut inbound) = inbound {
        inbound.shutdown().await;
    }
    drop(channel);

    match state.apply(SessionEvent::TeardownComplete) {
        Ok(phase) if phase.is_terminal() => debug!("accessory {identity} released"),
        Ok(phase) => warn!("teardown of {identity} left the session {phase}"),
        Err(e) => error!("{e}"),
    }
    reason
}

/// Feeds transfers to the dispatcher until the session token is cancelled,
/// then hands the transport back for shutdown.
async fn inbound_duty(
    mut inbound: Box<dyn InboundTransport>,
    dispatcher: CommandDispatcher,
    state: Arc<SessionState>,
) -> Box<dyn InboundTransport> {
    let token = state.token().clone();
    loop {
        let transfer = tokio::select! {
            _ = token.cancelled() => break,
            transfer = inbound.next_transfer() => transfer,
        };
        match transfer {
            Ok(Some(bytes)) => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = dispatcher.handle_transfer(&bytes) => {}
                }
            }
            Ok(None) => {}
            Err(e) if e.is_fatal() => {
                error!("inbound transfer failed: {e}");
                state.end(SessionEnd::TransportLost);
                break;
            }
            Err(e) => debug!("inbound transfer: {e}"),
        }
    }
    inbound
}
