//! # aoa-core
//!
//! Shared library for the AOA port-forwarding tunnel containing the frame
//! codec, USB device identities, and the per-session state machine.
//!
//! This crate is used by the `aoa-forward` host application and by its tests.
//! It has zero dependencies on USB libraries, sockets, or async runtimes.
//!
//! # Architecture overview (for beginners)
//!
//! An Android phone running a companion app is plugged into the host over USB.
//! The host switches the phone into *Android Open Accessory* (AOA) mode and
//! then both sides exchange small binary **frames** over two bulk endpoints.
//! The phone asks the host to open TCP connections to local ports; the host
//! relays bytes between those connections and the USB link.
//!
//! This crate (`aoa-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the USB link.  Every frame starts
//!   with a 4-byte header (2-byte command tag + 2-byte total length) followed
//!   by a command-specific payload.
//!
//! - **`domain`** – Pure rules with no OS dependencies: which USB vendor ids
//!   are Android devices we can negotiate with, which product ids mean "already
//!   in accessory mode", the six accessory descriptor strings, and the
//!   `Negotiating → Active → Closing → Closed` session lifecycle.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `aoa_core::Command` instead of `aoa_core::protocol::command::Command`.
pub use domain::device::{AccessoryStrings, DeviceFilter, DeviceIdentity};
pub use domain::session::{SessionEvent, SessionPhase, TransitionError};
pub use protocol::codec::{
    decode_header, decode_payload, encode, encode_message, encode_u16, split_frame, FrameHeader,
    Message, ProtocolError, SessionId,
};
pub use protocol::command::Command;
