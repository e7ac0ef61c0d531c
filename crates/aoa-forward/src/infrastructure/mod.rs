//! Infrastructure layer: the concrete USB, socket, and storage code behind
//! the application layer's traits.
//!
//! # Why a separate infrastructure layer? (for beginners)
//!
//! `application` only knows "send a frame", "next transfer", "acquire a
//! device".  Everything that touches the OS (USB through `nusb`, TCP sockets,
//! the config file) lives here, so the session logic can be
//! tested with the in-memory pieces from [`usb::mock`].

pub mod sockets;
pub mod storage;
pub mod usb;
