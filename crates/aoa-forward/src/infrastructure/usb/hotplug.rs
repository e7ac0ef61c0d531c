//! Device-attach notifications from `nusb::watch_devices`.

use std::io;

use aoa_core::DeviceIdentity;
use async_trait::async_trait;
use futures_util::StreamExt;
use nusb::hotplug::{HotplugEvent, HotplugWatch};
use tracing::trace;

use crate::application::supervisor::AttachWatcher;

pub struct NusbHotplug {
    watch: HotplugWatch,
}

impl NusbHotplug {
    /// Starts watching.  Fails on platforms without hotplug support, in
    /// which case the supervisor falls back to a fixed retry interval.
    ///
    /// # Errors
    ///
    /// Returns the platform error from `nusb`.
    pub fn new() -> Result<Self, io::Error> {
        Ok(Self {
            watch: nusb::watch_devices()?,
        })
    }
}

#[async_trait]
impl AttachWatcher for NusbHotplug {
    async fn wait_for_attach(&mut self) -> Option<DeviceIdentity> {
        while let Some(event) = self.watch.next().await {
            match event {
                HotplugEvent::Connected(info) => {
                    return Some(DeviceIdentity::new(info.vendor_id(), info.product_id()));
                }
                HotplugEvent::Disconnected(id) => trace!("device {id:?} detached"),
            }
        }
        None
    }
}
