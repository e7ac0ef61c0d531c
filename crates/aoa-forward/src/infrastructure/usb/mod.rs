//! USB side of the tunnel, built on `nusb`.
//!
//! - `negotiator` – find the phone, run the accessory handshake, claim it.
//! - `transport` – bulk frame writer and the two inbound read strategies.
//! - `hotplug` – attach notifications for the retry loop.
//! - `mock` – in-memory link used by tests.

pub mod hotplug;
pub mod mock;
pub mod negotiator;
pub mod transport;

pub use hotplug::NusbHotplug;
pub use negotiator::{
    ClaimedAccessory, Endpoints, NegotiationError, Negotiator, NegotiatorConfig,
    UsbAccessoryAcquirer,
};
pub use transport::{open_inbound, QueuedBulkReader, ThreadedBulkReader, UsbFrameWriter};
