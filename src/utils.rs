use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::descriptor::uvc::UvcConfig;
use crate::usb::{DeviceInfo, UsbDevice};

/// Which device and streaming interface to open
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSelector {
    /// Any vendor when unset
    pub vendor_id: Option<u16>,
    /// Any product when unset
    pub product_id: Option<u16>,
    /// Index among the device's video streaming interfaces
    pub stream_index: usize,
}

impl DeviceSelector {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        self.vendor_id.map_or(true, |vid| vid == info.vendor_id)
            && self.product_id.map_or(true, |pid| pid == info.product_id)
    }
}

/// Find the first attached video device matching `selector`.
///
/// `in_use` lists the (address, interface) pairs already streaming; such
/// interfaces are skipped. Devices whose configuration descriptor can't be
/// parsed are skipped too.
pub fn find_device(
    devices: &[Arc<dyn UsbDevice>],
    selector: &DeviceSelector,
    in_use: &[(u8, u8)],
) -> Option<(Arc<dyn UsbDevice>, UvcConfig)> {
    for device in devices {
        let info = device.info();
        if !selector.matches(&info) {
            continue;
        }

        let uvc = match UvcConfig::parse(&device.config_descriptor()) {
            Ok(uvc) => uvc,
            Err(e) => {
                debug!(address = info.address, %e, "Skipping device with bad descriptors");
                continue;
            }
        };
        let Some(vs) = uvc.streaming.get(selector.stream_index) else {
            debug!(address = info.address, "Not a video device, or too few streaming interfaces");
            continue;
        };
        if in_use.contains(&(info.address, vs.number)) {
            debug!(address = info.address, interface = vs.number, "Interface already in use");
            continue;
        }

        info!(
            address = info.address,
            vid = format_args!("{:04x}", info.vendor_id),
            pid = format_args!("{:04x}", info.product_id),
            interface = vs.number,
            "Found video device"
        );
        return Some((Arc::clone(device), uvc));
    }
    None
}
