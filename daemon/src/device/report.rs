use super::{DeviceId, Link, TransportError};
use hidapi::{HidApi, HidDevice, HidError};
use std::time::Duration;

impl From<HidError> for TransportError {
    fn from(e: HidError) -> Self {
        TransportError::Usb(e.to_string())
    }
}

/// Protocol B link over HID interrupt reports.
pub struct ReportLink {
    device: HidDevice,
}

impl ReportLink {
    pub fn open(id: DeviceId) -> Result<Self, TransportError> {
        let api = HidApi::new()?;
        let device = api.open(id.vendor, id.product).map_err(|e| {
            log::debug!("Display {}: hid open failed: {}", id, e);
            TransportError::NotFound(id)
        })?;
        device.set_blocking_mode(true)?;

        if let Ok(Some(product)) = device.get_product_string() {
            log::debug!("Display {}: {}", id, product);
        }

        Ok(Self { device })
    }
}

impl Link for ReportLink {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        Ok(self.device.write(data)?)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        Ok(self.device.read_timeout(buf, millis)?)
    }
}
