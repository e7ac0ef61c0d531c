//! Command-line surface of the `aoa-forward` binary.
//!
//! # Usage
//!
//! ```text
//! aoa-forward [VID PID] [OPTIONS]
//!
//! Arguments:
//!   [VID]  Vendor id of the phone in its normal mode, hex (18d1 or 0x18d1)
//!   [PID]  Product id of the phone in its normal mode, hex
//!
//! Options:
//!   --config <PATH>      Config file [default: platform config dir]
//!   --log-level <LEVEL>  error | warn | info | debug | trace
//!   --port <PORT>        Forwarding port used until the app announces one
//!   --no-hotplug         Retry on a fixed interval instead of attach events
//!   --print-config       Print the effective config as TOML and exit
//! ```
//!
//! CLI values override the config file.  Without `VID PID` the first attached
//! device from a compatible vendor is used.

use std::path::PathBuf;

use aoa_core::domain::device::COMPATIBLE_VENDOR_IDS;
use aoa_core::{DeviceFilter, DeviceIdentity};
use clap::Parser;
use thiserror::Error;

use crate::infrastructure::storage::config::AppConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("{0:04x} is not a compatible Android device vendor id (expected one of {list})", list = compatible_list())]
    IncompatibleVendor(u16),
}

fn compatible_list() -> String {
    COMPATIBLE_VENDOR_IDS
        .iter()
        .map(|vid| format!("{vid:04x}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// TCP port forwarding over Android Open Accessory.
#[derive(Debug, Parser)]
#[command(
    name = "aoa-forward",
    about = "Forward TCP connections from an Android accessory app to local ports",
    version
)]
pub struct Cli {
    /// Vendor id of the device to use, hex.
    #[arg(value_parser = parse_usb_id, requires = "product_id")]
    pub vendor_id: Option<u16>,

    /// Product id of the device to use, hex.
    #[arg(value_parser = parse_usb_id)]
    pub product_id: Option<u16>,

    /// Path to the TOML config file.
    #[arg(long, env = "AOA_FORWARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Forwarding port used until the device announces its own.
    #[arg(long)]
    pub port: Option<u16>,

    /// Disable hotplug notifications.
    #[arg(long)]
    pub no_hotplug: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    pub print_config: bool,
}

impl Cli {
    /// Validated device filter from the positional ids.
    ///
    /// # Errors
    ///
    /// See [`validate_device_ids`].
    pub fn device_filter(&self) -> Result<DeviceFilter, CliError> {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => validate_device_ids(vid, pid),
            _ => Ok(DeviceFilter::AnyCompatible),
        }
    }

    /// Writes the CLI overrides into `config`.
    ///
    /// # Errors
    ///
    /// Returns [`CliError`] if the device ids are rejected.
    pub fn apply_to(&self, config: &mut AppConfig) -> Result<(), CliError> {
        if let DeviceFilter::Exact(identity) = self.device_filter()? {
            config.device.vendor_id = Some(identity.vendor_id);
            config.device.product_id = Some(identity.product_id);
        }
        if let Some(level) = &self.log_level {
            config.logging.log_level = level.clone();
        }
        if let Some(port) = self.port {
            config.forward.default_port = port;
        }
        if self.no_hotplug {
            config.supervisor.use_hotplug = false;
        }
        Ok(())
    }
}

/// Parses a hex USB id with an optional `0x` prefix.
///
/// # Errors
///
/// Returns a message for clap if `s` is not a 16-bit hex number.
pub fn parse_usb_id(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("'{s}' is not a 16-bit hex id: {e}"))
}

/// Checks an explicit `vid:pid` before any USB work.
///
/// An accessory-mode identity is accepted; negotiation then skips the
/// handshake for a phone still in accessory mode.
///
/// # Errors
///
/// Returns [`CliError::IncompatibleVendor`] for a vendor outside the
/// compatible set.
pub fn validate_device_ids(vendor_id: u16, product_id: u16) -> Result<DeviceFilter, CliError> {
    let identity = DeviceIdentity::new(vendor_id, product_id);
    if !identity.is_compatible_vendor() {
        return Err(CliError::IncompatibleVendor(vendor_id));
    }
    Ok(DeviceFilter::Exact(identity))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
