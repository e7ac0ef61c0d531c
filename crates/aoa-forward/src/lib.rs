//! Host side of a TCP port-forwarding tunnel over Android Open Accessory.
//!
//! The phone's companion app asks for sockets with CONNECT_SOCKET; this crate
//! dials `localhost:<port>` for each one and shuttles bytes both ways over a
//! single pair of USB bulk endpoints.
//!
//! - [`application`] – sessions, dispatch, forwarding, supervision.
//! - [`infrastructure`] – `nusb` transports, TCP socket registry, config.
//! - [`cli`] – command-line surface of the `aoa-forward` binary.

pub mod application;
pub mod cli;
pub mod infrastructure;
