//! Device Negotiator: find a phone, switch it into accessory mode, claim it.
//!
//! # Negotiation sequence
//!
//! ```text
//! find_device(filter)            scan, retry `find_attempts` times
//!   already accessory? ──yes──┐
//!   │ no                      │
//! GET_PROTOCOL (51)           │  version must be >= 1
//! SEND_STRING  (52) x 6       │  each write must move the whole string
//! AUDIO_SUPPORT(58)           │  only when version == 2
//! START        (53)           │
//! sleep, rescan for an        │
//! accessory-mode identity     │
//!   ◄─────────────────────────┘
//! claim interface 0, settle, resolve bulk IN/OUT
//! ```
//!
//! Everything here blocks (control transfers, sleeps) and is meant to run on
//! Tokio's blocking pool; [`UsbAccessoryAcquirer`] does that and wraps the
//! result into an [`AccessoryLink`].
//!
//! The control-transfer half sits behind [`ControlChannel`] so the handshake
//! can be unit-tested with a mock instead of a phone.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aoa_core::domain::device::{requests, AUDIO_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};
use aoa_core::{AccessoryStrings, DeviceFilter, DeviceIdentity};
use async_trait::async_trait;
use nusb::transfer::{Control, ControlType, EndpointType, Recipient};
use nusb::{Device, DeviceInfo, Interface};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::transport::{open_inbound, UsbFrameWriter};
use crate::application::link::AccessoryLink;
use crate::application::supervisor::{AcquireError, DeviceAcquirer};
use crate::infrastructure::storage::config::{AppConfig, TransportConfig};

/// The accessory function always lives on interface 0.
pub const ACCESSORY_INTERFACE: u8 = 0;

/// Direction bit of an endpoint address; set means device-to-host.
const ENDPOINT_DIR_IN: u8 = 0x80;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no {wanted} found after {attempts} attempt(s)")]
    DeviceNotFound { wanted: String, attempts: u32 },

    #[error("accessory mode: {0}")]
    AccessoryMode(String),

    #[error("interface {interface} has no bulk IN/OUT endpoint pair")]
    EndpointsUnavailable { interface: u8 },

    #[error("USB {op} failed: {source}")]
    Usb {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("control request {request} failed: {detail}")]
    Control { request: u8, detail: String },
}

// ── Control transfers ─────────────────────────────────────────────────────────

/// Vendor control transfers addressed to the device.
#[cfg_attr(test, mockall::automock)]
pub trait ControlChannel {
    /// Reads up to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Control`] if the transfer fails.
    fn vendor_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
    ) -> Result<Vec<u8>, NegotiationError>;

    /// Writes `data` and returns how many bytes the device accepted.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Control`] if the transfer fails.
    fn vendor_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, NegotiationError>;
}

/// [`ControlChannel`] over an opened `nusb` device.
pub struct DeviceControl<'a> {
    device: &'a Device,
    timeout: Duration,
}

impl<'a> DeviceControl<'a> {
    pub fn new(device: &'a Device, timeout: Duration) -> Self {
        Self { device, timeout }
    }
}

fn vendor_request(request: u8, value: u16, index: u16) -> Control {
    Control {
        control_type: ControlType::Vendor,
        recipient: Recipient::Device,
        request,
        value,
        index,
    }
}

impl ControlChannel for DeviceControl<'_> {
    fn vendor_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
    ) -> Result<Vec<u8>, NegotiationError> {
        let mut buf = vec![0u8; len];
        let n = self
            .device
            .control_in_blocking(vendor_request(request, value, index), &mut buf, self.timeout)
            .map_err(|e| NegotiationError::Control {
                request,
                detail: e.to_string(),
            })?;
        buf.truncate(n);
        Ok(buf)
    }

    fn vendor_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, NegotiationError> {
        self.device
            .control_out_blocking(vendor_request(request, value, index), data, self.timeout)
            .map_err(|e| NegotiationError::Control {
                request,
                detail: e.to_string(),
            })
    }
}

/// Runs the accessory handshake up to and including START.
///
/// Returns the AOA protocol version the device reported.
///
/// # Errors
///
/// - [`NegotiationError::AccessoryMode`] if the device does not support
///   accessory mode.
/// - [`NegotiationError::Control`] if any transfer fails or moves the wrong
///   number of bytes.
pub fn send_accessory_handshake<C>(
    control: &C,
    strings: &AccessoryStrings,
) -> Result<u16, NegotiationError>
where
    C: ControlChannel + ?Sized,
{
    let raw = control.vendor_in(requests::GET_PROTOCOL, 0, 0, 2)?;
    let version = match raw.as_slice() {
        [lo, hi] => u16::from_le_bytes([*lo, *hi]),
        other => {
            return Err(NegotiationError::Control {
                request: requests::GET_PROTOCOL,
                detail: format!("expected 2 version bytes, got {}", other.len()),
            })
        }
    };
    if version < MIN_PROTOCOL_VERSION {
        return Err(NegotiationError::AccessoryMode(format!(
            "device reports AOA protocol {version}"
        )));
    }
    info!("device speaks AOA protocol {version}");

    for (index, value) in strings.indexed() {
        let sent = control.vendor_out(requests::SEND_STRING, 0, index, value.as_bytes())?;
        if sent != value.len() {
            return Err(NegotiationError::Control {
                request: requests::SEND_STRING,
                detail: format!("string {index}: device took {sent} of {} bytes", value.len()),
            });
        }
    }

    if version == AUDIO_PROTOCOL_VERSION {
        let sent = control.vendor_out(requests::AUDIO_SUPPORT, 1, 0, &[])?;
        if sent != 0 {
            return Err(NegotiationError::Control {
                request: requests::AUDIO_SUPPORT,
                detail: format!("unexpected {sent}-byte data stage"),
            });
        }
    }

    control.vendor_out(requests::START, 0, 0, &[])?;
    debug!("accessory start requested");
    Ok(version)
}

// ── Discovery helpers ─────────────────────────────────────────────────────────

/// Calls `probe` up to `attempts` times, sleeping `backoff` between misses.
///
/// # Errors
///
/// Returns [`NegotiationError::DeviceNotFound`] if every probe misses.
pub fn find_with_retry<T>(
    attempts: u32,
    backoff: Duration,
    wanted: &str,
    mut probe: impl FnMut() -> Result<Option<T>, NegotiationError>,
) -> Result<T, NegotiationError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(found) = probe()? {
            return Ok(found);
        }
        debug!("no {wanted} (attempt {attempt}/{attempts})");
        if attempt < attempts {
            thread::sleep(backoff);
        }
    }
    Err(NegotiationError::DeviceNotFound {
        wanted: wanted.to_string(),
        attempts,
    })
}

/// Bulk endpoint addresses on the accessory interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
    /// Max packet size of the OUT endpoint.
    pub max_packet_size: usize,
}

/// Splits `(address, max_packet_size)` pairs of bulk endpoints into IN and
/// OUT by the direction bit.
///
/// # Errors
///
/// Returns [`NegotiationError::EndpointsUnavailable`] unless both directions
/// are present.
pub fn classify_endpoints(
    endpoints: impl IntoIterator<Item = (u8, usize)>,
    interface: u8,
) -> Result<Endpoints, NegotiationError> {
    let mut bulk_in = None;
    let mut bulk_out = None;
    for (address, max_packet_size) in endpoints {
        if address & ENDPOINT_DIR_IN != 0 {
            bulk_in.get_or_insert(address);
        } else {
            bulk_out.get_or_insert((address, max_packet_size));
        }
    }
    match (bulk_in, bulk_out) {
        (Some(bulk_in), Some((bulk_out, max_packet_size))) => Ok(Endpoints {
            bulk_in,
            bulk_out,
            max_packet_size,
        }),
        _ => Err(NegotiationError::EndpointsUnavailable { interface }),
    }
}

fn identity_of(info: &DeviceInfo) -> DeviceIdentity {
    DeviceIdentity::new(info.vendor_id(), info.product_id())
}

fn usb_error(op: &'static str) -> impl FnOnce(io::Error) -> NegotiationError {
    move |source| NegotiationError::Usb { op, source }
}

// ── Negotiator ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub strings: AccessoryStrings,
    pub find_attempts: u32,
    pub find_backoff: Duration,
    pub reenumeration_delay: Duration,
    pub settle_delay: Duration,
    pub control_timeout: Duration,
}

impl NegotiatorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let supervisor = &config.supervisor;
        Self {
            strings: config.accessory.clone(),
            find_attempts: supervisor.find_attempts,
            find_backoff: supervisor.find_backoff(),
            reenumeration_delay: supervisor.reenumeration_delay(),
            settle_delay: supervisor.settle_delay(),
            control_timeout: supervisor.control_timeout(),
        }
    }
}

/// An accessory-mode device with its interface claimed.
pub struct ClaimedAccessory {
    pub identity: DeviceIdentity,
    pub interface: Interface,
    pub endpoints: Endpoints,
}

pub struct Negotiator {
    config: NegotiatorConfig,
}

impl Negotiator {
    pub fn new(config: NegotiatorConfig) -> Self {
        Self { config }
    }

    /// Opens the first attached device accepted by `filter`, retrying.
    ///
    /// # Errors
    ///
    /// - [`NegotiationError::DeviceNotFound`] when no device matches.
    /// - [`NegotiationError::Usb`] when enumeration or opening fails.
    pub fn find_device(
        &self,
        filter: DeviceFilter,
    ) -> Result<(DeviceIdentity, Device), NegotiationError> {
        self.find_where(&format!("device matching {filter}"), |identity| filter.matches(identity))
    }

    /// True iff `identity` is already in accessory mode.
    pub fn is_already_accessory(&self, identity: &DeviceIdentity) -> bool {
        identity.is_accessory()
    }

    /// Runs the handshake on `device`, waits for it to re-enumerate, and opens
    /// the accessory-mode device.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::AccessoryMode`] when the device refuses or
    /// does not come back as an accessory, or the handshake's own errors.
    pub fn enter_accessory_mode(
        &self,
        device: &Device,
    ) -> Result<(DeviceIdentity, Device), NegotiationError> {
        let control = DeviceControl::new(device, self.config.control_timeout);
        send_accessory_handshake(&control, &self.config.strings)?;

        thread::sleep(self.config.reenumeration_delay);
        let wanted = "device in accessory mode";
        self.find_where(wanted, |identity| {
            identity.is_compatible_vendor() && identity.is_accessory()
        })
        .map_err(|e| match e {
            NegotiationError::DeviceNotFound { .. } => {
                NegotiationError::AccessoryMode("device did not re-enumerate as an accessory".into())
            }
            other => other,
        })
    }

    /// Resolves the bulk endpoint pair of the accessory interface.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::EndpointsUnavailable`] if the interface or
    /// either endpoint is missing.
    pub fn resolve_endpoints(&self, device: &Device) -> Result<Endpoints, NegotiationError> {
        let configuration = device.active_configuration().map_err(|e| NegotiationError::Usb {
            op: "read active configuration",
            source: io::Error::other(e.to_string()),
        })?;
        let alt = configuration
            .interface_alt_settings()
            .find(|alt| alt.interface_number() == ACCESSORY_INTERFACE && alt.alternate_setting() == 0)
            .ok_or(NegotiationError::EndpointsUnavailable {
                interface: ACCESSORY_INTERFACE,
            })?;
        let bulk: Vec<(u8, usize)> = alt
            .endpoints()
            .filter(|ep| ep.transfer_type() == EndpointType::Bulk)
            .map(|ep| (ep.address(), ep.max_packet_size()))
            .collect();
        classify_endpoints(bulk, ACCESSORY_INTERFACE)
    }

    /// Full negotiation for one session.
    ///
    /// # Errors
    ///
    /// Any [`NegotiationError`] from the steps above, or a claim failure.
    pub fn negotiate(&self, filter: DeviceFilter) -> Result<ClaimedAccessory, NegotiationError> {
        let (found, device) = self.find_device(filter)?;
        let (identity, device) = if self.is_already_accessory(&found) {
            info!("device {found} is already in accessory mode");
            (found, device)
        } else {
            self.enter_accessory_mode(&device)?
        };

        let interface = device
            .claim_interface(ACCESSORY_INTERFACE)
            .map_err(usb_error("claim interface"))?;
        thread::sleep(self.config.settle_delay);

        let endpoints = self.resolve_endpoints(&device)?;
        info!(
            "accessory {identity}: bulk IN {:#04x}, bulk OUT {:#04x}, max packet {}",
            endpoints.bulk_in, endpoints.bulk_out, endpoints.max_packet_size
        );
        Ok(ClaimedAccessory {
            identity,
            interface,
            endpoints,
        })
    }

    fn find_where(
        &self,
        wanted: &str,
        accept: impl Fn(&DeviceIdentity) -> bool,
    ) -> Result<(DeviceIdentity, Device), NegotiationError> {
        let info = find_with_retry(
            self.config.find_attempts,
            self.config.find_backoff,
            wanted,
            || match nusb::list_devices() {
                Ok(mut devices) => Ok(devices.find(|info| accept(&identity_of(info)))),
                Err(e) => {
                    warn!("USB enumeration failed: {e}");
                    Ok(None)
                }
            },
        )?;

        let identity = identity_of(&info);
        info!(
            "found device {identity} ({} {})",
            info.manufacturer_string().unwrap_or("unknown manufacturer"),
            info.product_string().unwrap_or("unknown product")
        );
        let device = info.open().map_err(usb_error("open device"))?;
        Ok((identity, device))
    }
}

// ── Acquirer ──────────────────────────────────────────────────────────────────

/// [`DeviceAcquirer`] that negotiates on the blocking pool and builds the
/// bulk transports.
pub struct UsbAccessoryAcquirer {
    negotiator: Arc<Negotiator>,
    transport: TransportConfig,
}

impl UsbAccessoryAcquirer {
    pub fn new(negotiator: Negotiator, transport: TransportConfig) -> Self {
        Self {
            negotiator: Arc::new(negotiator),
            transport,
        }
    }
}

#[async_trait]
impl DeviceAcquirer for UsbAccessoryAcquirer {
    async fn acquire(&self, filter: DeviceFilter) -> Result<AccessoryLink, AcquireError> {
        let negotiator = Arc::clone(&self.negotiator);
        let claimed = tokio::task::spawn_blocking(move || negotiator.negotiate(filter)).await??;

        let inbound = open_inbound(&claimed.interface, claimed.endpoints.bulk_in, &self.transport);
        let outbound = Arc::new(UsbFrameWriter::new(
            claimed.interface,
            claimed.endpoints,
            self.transport.write_timeout(),
        ));
        Ok(AccessoryLink {
            identity: claimed.identity,
            inbound,
            outbound,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Mutex;

    fn accepting_strings(control: &mut MockControlChannel) {
        control
            .expect_vendor_out()
            .withf(|request, _, _, _| *request == requests::SEND_STRING)
            .times(6)
            .returning(|_, _, _, data| Ok(data.len()));
    }

    fn reporting_version(control: &mut MockControlChannel, version: u16) {
        control
            .expect_vendor_in()
            .withf(|request, _, _, len| *request == requests::GET_PROTOCOL && *len == 2)
            .times(1)
            .returning(move |_, _, _, _| Ok(version.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_version_one_skips_audio_and_still_starts() {
        // Arrange
        let mut control = MockControlChannel::new();
        reporting_version(&mut control, 1);
        accepting_strings(&mut control);
        control
            .expect_vendor_out()
            .withf(|request, _, _, _| *request == requests::AUDIO_SUPPORT)
            .times(0);
        control
            .expect_vendor_out()
            .withf(|request, _, _, _| *request == requests::START)
            .times(1)
            .returning(|_, _, _, _| Ok(0));

        // Act
        let version = send_accessory_handshake(&control, &AccessoryStrings::default()).unwrap();

        // Assert
        assert_eq!(version, 1);
    }

    #[test]
    fn test_version_two_enables_audio_with_value_one() {
        // Arrange
        let mut control = MockControlChannel::new();
        reporting_version(&mut control, 2);
        accepting_strings(&mut control);
        control
            .expect_vendor_out()
            .withf(|request, value, _, data| {
                *request == requests::AUDIO_SUPPORT && *value == 1 && data.is_empty()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(0));
        control
            .expect_vendor_out()
            .withf(|request, _, _, _| *request == requests::START)
            .times(1)
            .returning(|_, _, _, _| Ok(0));

        // Act / Assert
        assert_eq!(
            send_accessory_handshake(&control, &AccessoryStrings::default()).unwrap(),
            2
        );
    }

    #[test]
    fn test_strings_are_sent_in_index_order() {
        // Arrange
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut control = MockControlChannel::new();
        reporting_version(&mut control, 1);
        let recorder = Arc::clone(&seen);
        control
            .expect_vendor_out()
            .withf(|request, _, _, _| *request == requests::SEND_STRING)
            .returning(move |_, _, index, data| {
                recorder.lock().unwrap().push((index, String::from_utf8_lossy(data).into_owned()));
                Ok(data.len())
            });
        control
            .expect_vendor_out()
            .withf(|request, _, _, _| *request == requests::START)
            .returning(|_, _, _, _| Ok(0));

        // Act
        send_accessory_handshake(&control, &AccessoryStrings::default()).unwrap();

        // Assert
        let seen = seen.lock().unwrap();
        let indices: Vec<u16> = seen.iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(seen[0].1, "Arksine");
        assert_eq!(seen[1].1, "PortForward");
    }

    #[test]
    fn test_short_string_write_fails_negotiation() {
        // Arrange
        let mut control = MockControlChannel::new();
        reporting_version(&mut control, 1);
        control
            .expect_vendor_out()
            .withf(|request, _, _, _| *request == requests::SEND_STRING)
            .times(1)
            .returning(|_, _, _, data| Ok(data.len() - 1));
        control
            .expect_vendor_out()
            .withf(|request, _, _, _| *request == requests::START)
            .times(0);

        // Act
        let result = send_accessory_handshake(&control, &AccessoryStrings::default());

        // Assert
        assert!(matches!(
            result,
            Err(NegotiationError::Control { request: requests::SEND_STRING, .. })
        ));
    }

    #[test]
    fn test_version_zero_is_not_an_accessory() {
        let mut control = MockControlChannel::new();
        reporting_version(&mut control, 0);
        control.expect_vendor_out().times(0);

        let result = send_accessory_handshake(&control, &AccessoryStrings::default());

        assert!(matches!(result, Err(NegotiationError::AccessoryMode(_))));
    }

    #[test]
    fn test_truncated_version_read_is_a_control_error() {
        let mut control = MockControlChannel::new();
        control
            .expect_vendor_in()
            .returning(|_, _, _, _| Ok(vec![0x01]));

        let result = send_accessory_handshake(&control, &AccessoryStrings::default());

        assert!(matches!(
            result,
            Err(NegotiationError::Control { request: requests::GET_PROTOCOL, .. })
        ));
    }

    #[test]
    fn test_find_gives_up_after_the_attempt_budget() {
        // Arrange
        let calls = Cell::new(0);

        // Act
        let result: Result<(), _> = find_with_retry(5, Duration::ZERO, "phone", || {
            calls.set(calls.get() + 1);
            Ok(None)
        });

        // Assert
        assert_eq!(calls.get(), 5);
        assert!(matches!(
            result,
            Err(NegotiationError::DeviceNotFound { attempts: 5, .. })
        ));
    }

    #[test]
    fn test_find_returns_as_soon_as_the_probe_hits() {
        let calls = Cell::new(0);
        let found = find_with_retry(5, Duration::ZERO, "phone", || {
            calls.set(calls.get() + 1);
            Ok((calls.get() == 3).then_some("pixel"))
        })
        .unwrap();
        assert_eq!(found, "pixel");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_endpoints_split_by_direction_bit() {
        let endpoints = classify_endpoints([(0x81, 512), (0x02, 512)], 0).unwrap();
        assert_eq!(
            endpoints,
            Endpoints {
                bulk_in: 0x81,
                bulk_out: 0x02,
                max_packet_size: 512
            }
        );
    }

    #[test]
    fn test_missing_out_endpoint_is_unavailable() {
        let result = classify_endpoints([(0x81, 64)], 0);
        assert!(matches!(
            result,
            Err(NegotiationError::EndpointsUnavailable { interface: 0 })
        ));
    }

    #[test]
    fn test_already_accessory_identity_is_detected() {
        let negotiator = Negotiator::new(NegotiatorConfig::from_app_config(&AppConfig::default()));
        assert!(negotiator.is_already_accessory(&DeviceIdentity::new(0x18D1, 0x2D01)));
        assert!(!negotiator.is_already_accessory(&DeviceIdentity::new(0x04E8, 0x6860)));
    }
}
