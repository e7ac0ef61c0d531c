//! Domain entities for the AOA tunnel.
//!
//! This module contains pure rules with no infrastructure dependencies.
//!
//! # What lives here? (for beginners)
//!
//! Domain code describes *what* the system is without saying *how* it talks to
//! hardware:
//!
//! - [`device`] knows which USB identities are Android phones we may switch
//!   into accessory mode and which identities mean "already switched".  It also
//!   holds the six descriptor strings the host announces during negotiation.
//! - [`session`] is the lifecycle of one accessory session as a small state
//!   machine.  The application layer drives it; infrastructure never touches it.
//!
//! Everything here compiles and tests on any machine without a USB stack.

/// USB identities, filters, and accessory descriptor strings.
pub mod device;

/// The per-session lifecycle state machine.
pub mod session;
