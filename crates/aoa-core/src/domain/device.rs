//! USB device identities and the accessory-mode rules that apply to them.
//!
//! # Android Open Accessory in one paragraph (for beginners)
//!
//! A phone plugged in normally enumerates under its manufacturer's vendor id
//! (Samsung, Sony, ...).  The host sends a handful of vendor control requests:
//! "which AOA protocol version do you speak?" (51), six "here is my identity
//! string" writes (52), optionally "enable audio" (58), and "start accessory
//! mode" (53).  The phone then disconnects and re-enumerates as Google's vendor
//! id `0x18D1` with one of the accessory product ids below.  From that point
//! the phone's companion app owns a pair of bulk endpoints on interface 0.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Known identities ──────────────────────────────────────────────────────────

/// Vendor id Android devices use once they are in accessory mode.
pub const ACCESSORY_VENDOR_ID: u16 = 0x18D1;

/// Product ids that mean the device is already in accessory mode
/// (accessory, accessory+adb, audio+accessory, audio+accessory+adb).
pub const ACCESSORY_PRODUCT_IDS: [u16; 4] = [0x2D00, 0x2D01, 0x2D04, 0x2D05];

/// Vendor ids we attempt accessory negotiation with when no filter is given
/// (Google, Sony, NVIDIA, Samsung).
pub const COMPATIBLE_VENDOR_IDS: [u16; 4] = [0x18D1, 0x0FCE, 0x0E0F, 0x04E8];

// ── ADK control requests ──────────────────────────────────────────────────────

/// Vendor control request numbers used during accessory negotiation.
pub mod requests {
    /// Read the 16-bit AOA protocol version (IN, 2 bytes).
    pub const GET_PROTOCOL: u8 = 51;
    /// Send one identity string (OUT, `index` selects which).
    pub const SEND_STRING: u8 = 52;
    /// Switch the device into accessory mode (OUT, no data).
    pub const START: u8 = 53;
    /// Enable the audio accessory function (OUT, `value = 1`, protocol 2 only).
    pub const AUDIO_SUPPORT: u8 = 58;
}

/// Lowest protocol version that understands accessory mode at all.
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Protocol version that adds audio support.
pub const AUDIO_PROTOCOL_VERSION: u16 = 2;

// ── DeviceIdentity ────────────────────────────────────────────────────────────

/// A USB `vendor_id:product_id` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self { vendor_id, product_id }
    }

    /// True iff the product id is one of the accessory-mode product ids.
    pub fn is_accessory(&self) -> bool {
        ACCESSORY_PRODUCT_IDS.contains(&self.product_id)
    }

    /// True iff the vendor id is one we know how to negotiate with.
    pub fn is_compatible_vendor(&self) -> bool {
        COMPATIBLE_VENDOR_IDS.contains(&self.vendor_id)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

// ── DeviceFilter ──────────────────────────────────────────────────────────────

/// Which attached devices a negotiation attempt may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceFilter {
    /// Any device whose vendor id is in [`COMPATIBLE_VENDOR_IDS`].
    #[default]
    AnyCompatible,
    /// Exactly this `vendor_id:product_id`.
    Exact(DeviceIdentity),
}

impl DeviceFilter {
    /// Builds a filter from optional CLI/config ids; both must be present for
    /// an exact match.
    pub fn from_ids(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        match (vendor_id, product_id) {
            (Some(vid), Some(pid)) => DeviceFilter::Exact(DeviceIdentity::new(vid, pid)),
            _ => DeviceFilter::AnyCompatible,
        }
    }

    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        match self {
            DeviceFilter::AnyCompatible => identity.is_compatible_vendor(),
            DeviceFilter::Exact(wanted) => wanted == identity,
        }
    }

    /// Whether a hotplug attach of `identity` should trigger a new attempt.
    ///
    /// Only compatible vendors are considered, and an exact filter must match.
    pub fn accepts_attach(&self, identity: &DeviceIdentity) -> bool {
        identity.is_compatible_vendor() && self.matches(identity)
    }

    /// The filter to use for the attempt that follows an attach of `identity`.
    pub fn narrowed_to(&self, identity: DeviceIdentity) -> DeviceFilter {
        match self {
            DeviceFilter::AnyCompatible => DeviceFilter::Exact(identity),
            exact @ DeviceFilter::Exact(_) => *exact,
        }
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFilter::AnyCompatible => f.write_str("any compatible device"),
            DeviceFilter::Exact(identity) => write!(f, "{identity}"),
        }
    }
}

// ── AccessoryStrings ──────────────────────────────────────────────────────────

/// The six identity strings sent with request 52, in index order 0..=5.
///
/// The device-side app checks `manufacturer` and `model` before it accepts the
/// accessory, so changing them locks out the stock companion app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryStrings {
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_serial")]
    pub serial: String,
}

impl AccessoryStrings {
    /// Returns `(index, string)` pairs in the order they are sent.
    pub fn indexed(&self) -> [(u16, &str); 6] {
        [
            (0, self.manufacturer.as_str()),
            (1, self.model.as_str()),
            (2, self.description.as_str()),
            (3, self.version.as_str()),
            (4, self.uri.as_str()),
            (5, self.serial.as_str()),
        ]
    }
}

fn default_manufacturer() -> String {
    "Arksine".to_string()
}
fn default_model() -> String {
    "PortForward".to_string()
}
fn default_description() -> String {
    "TCP port forwarding over Android Open Accessory".to_string()
}
fn default_version() -> String {
    "0.1".to_string()
}
fn default_uri() -> String {
    "https://source.android.com/docs/core/interaction/accessories/aoa".to_string()
}
fn default_serial() -> String {
    "1337".to_string()
}

impl Default for AccessoryStrings {
    fn default() -> Self {
        Self {
            manufacturer: default_manufacturer(),
            model: default_model(),
            description: default_description(),
            version: default_version(),
            uri: default_uri(),
            serial: default_serial(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
