//! Application layer: the session use cases.
//!
//! # What is the application layer? (for beginners)
//!
//! This layer decides *what happens* when a frame arrives or a socket becomes
//! readable, without knowing how USB transfers or sockets are implemented.  It
//! talks to the outside world through traits (`FrameSink`, `InboundTransport`,
//! `DeviceAcquirer`, `AttachWatcher`) that the infrastructure layer
//! implements.  Tests substitute in-memory implementations.
//!
//! - [`link`] – the transport traits and the negotiated `AccessoryLink`.
//! - [`session`] – per-session state and the gated outbound frame path.
//! - [`dispatch`] – inbound frames → socket operations.
//! - [`forward`] – readable sockets → outbound DATA frames.
//! - [`supervisor`] – acquire, run, tear down, and retry sessions.

pub mod dispatch;
pub mod forward;
pub mod link;
pub mod session;
pub mod supervisor;
