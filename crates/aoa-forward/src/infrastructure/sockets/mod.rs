//! Local TCP side of the tunnel.
//!
//! - `registry` – the arena of forwarded sockets, keyed by session id.
//! - `write` – the partial-write loop that guarantees full delivery.

pub mod registry;
pub mod write;

pub use registry::{ConnectOutcome, RegistryConfig, RegistryError, SocketHandle, SocketRegistry};
pub use write::{write_fully, NonBlockingWrite, SocketWriteBroken};
