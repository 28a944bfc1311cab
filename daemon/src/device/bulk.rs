use super::{DeviceId, Link, TRANSFER_TIMEOUT, TransportError};
use rusb::{ConfigDescriptor, DeviceHandle, Direction, GlobalContext, TransferType};
use std::time::Duration;

const INTERFACE: u8 = 0;

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::NoDevice => TransportError::Disconnected,
            e => TransportError::Usb(e.to_string()),
        }
    }
}

/// Bulk OUT and IN endpoint addresses of interface 0.
fn bulk_endpoints(config: &ConfigDescriptor) -> Option<(u8, u8)> {
    let mut out = None;
    let mut r#in = None;

    for interface in config.interfaces().filter(|i| i.number() == INTERFACE) {
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::Out => {
                        out.get_or_insert(endpoint.address());
                    }
                    Direction::In => {
                        r#in.get_or_insert(endpoint.address());
                    }
                }
            }
        }
    }

    out.zip(r#in)
}

/// Protocol A link over libusb bulk transfers.
pub struct BulkLink {
    handle: DeviceHandle<GlobalContext>,
    endpoint_out: u8,
    endpoint_in: u8,
}

impl BulkLink {
    pub fn open(id: DeviceId) -> Result<Self, TransportError> {
        let mut handle = rusb::open_device_with_vid_pid(id.vendor, id.product)
            .ok_or(TransportError::NotFound(id))?;

        let config = handle.device().active_config_descriptor()?;
        let (endpoint_out, endpoint_in) = bulk_endpoints(&config).ok_or_else(|| {
            TransportError::Usb(format!("{id} has no bulk endpoint pair on interface 0"))
        })?;

        // Not supported on every platform
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            log::debug!("Display {}: kernel driver auto-detach unavailable: {}", id, e);
        }
        handle.claim_interface(INTERFACE)?;

        log::debug!(
            "Display {}: bulk endpoints OUT {:#04x} IN {:#04x}",
            id,
            endpoint_out,
            endpoint_in
        );

        Ok(Self {
            handle,
            endpoint_out,
            endpoint_in,
        })
    }
}

impl Link for BulkLink {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        Ok(self
            .handle
            .write_bulk(self.endpoint_out, data, TRANSFER_TIMEOUT)?)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        match self.handle.read_bulk(self.endpoint_in, buf, timeout) {
            Ok(len) => Ok(len),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for BulkLink {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(INTERFACE);
    }
}
