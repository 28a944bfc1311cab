//! USB LCD panels
//!
//! - `bulk`: protocol A panels on a pair of bulk endpoints (feature `usb`)
//! - `report`: protocol B panels driven through HID reports (feature `usb`)
//! - [`DeviceChannel`]: handshake, JPEG encoding and frame transmission over
//!   any [`Link`]

#[cfg(feature = "usb")]
mod bulk;
mod channel;
#[cfg(feature = "usb")]
mod report;

#[cfg(feature = "usb")]
pub use bulk::BulkLink;
pub use channel::{DEFAULT_JPEG_QUALITY, DeviceChannel, encode_jpeg};
#[cfg(feature = "usb")]
pub use report::ReportLink;

use common::{Protocol, ProtocolError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Timeout for a single transfer
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeout for reading the handshake reply
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device {0} not found")]
    NotFound(DeviceId),

    #[error("Device disconnected")]
    Disconnected,

    #[error("USB error: {0}")]
    Usb(String),

    #[error("Short write ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] ProtocolError),

    #[error("JPEG encoding failed: {0}")]
    Encode(String),

    #[error("USB support not compiled in (build with --features usb)")]
    Unsupported,
}

impl From<TransportError> for common::LcdError {
    fn from(e: TransportError) -> Self {
        common::LcdError::Transport(e.to_string())
    }
}

/// Raw I/O with a panel.
pub trait Link: Send {
    /// Write one transfer, returning the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read one transfer. Returns 0 when nothing arrived within `timeout`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
}

/// USB vendor and product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vendor: u16,
    pub product: u16,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// A supported panel model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownDevice {
    pub id: DeviceId,
    pub protocol: Protocol,
    pub name: &'static str,
}

pub const KNOWN_DEVICES: &[KnownDevice] = &[
    KnownDevice {
        id: DeviceId {
            vendor: 0x87ad,
            product: 0x70db,
        },
        protocol: Protocol::Bulk,
        name: "bulk-endpoint panel",
    },
    KnownDevice {
        id: DeviceId {
            vendor: 0x0416,
            product: 0x5302,
        },
        protocol: Protocol::Report,
        name: "HID report panel",
    },
];

/// Look up a supported model by id.
pub fn known_device(vendor: u16, product: u16) -> Option<KnownDevice> {
    KNOWN_DEVICES
        .iter()
        .find(|d| d.id.vendor == vendor && d.id.product == product)
        .copied()
}

/// Supported panels currently attached, one entry per model.
#[cfg(feature = "usb")]
pub fn discover() -> Vec<KnownDevice> {
    let devices = match rusb::devices() {
        Ok(devices) => devices,
        Err(e) => {
            log::warn!("Failed to enumerate USB devices: {}", e);
            return Vec::new();
        }
    };

    let mut found: Vec<KnownDevice> = Vec::new();
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if let Some(known) = known_device(descriptor.vendor_id(), descriptor.product_id()) {
            if found.contains(&known) {
                log::warn!(
                    "Display {}: more than one attached, only the first is driven",
                    known.id
                );
                continue;
            }
            log::info!(
                "Found {} {} on bus {} address {}",
                known.name,
                known.id,
                device.bus_number(),
                device.address()
            );
            found.push(known);
        }
    }
    found
}

#[cfg(not(feature = "usb"))]
pub fn discover() -> Vec<KnownDevice> {
    log::warn!("USB support not compiled in, no panels can be discovered");
    Vec::new()
}

/// Open the transport matching a panel's protocol.
#[cfg(feature = "usb")]
pub fn open_link(device: &KnownDevice) -> Result<Box<dyn Link>, TransportError> {
    match device.protocol {
        Protocol::Bulk => Ok(Box::new(BulkLink::open(device.id)?)),
        Protocol::Report => Ok(Box::new(ReportLink::open(device.id)?)),
    }
}

#[cfg(not(feature = "usb"))]
pub fn open_link(_device: &KnownDevice) -> Result<Box<dyn Link>, TransportError> {
    Err(TransportError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_devices() {
        let bulk = known_device(0x87ad, 0x70db).unwrap();
        assert_eq!(bulk.protocol, Protocol::Bulk);

        let report = known_device(0x0416, 0x5302).unwrap();
        assert_eq!(report.protocol, Protocol::Report);

        assert!(known_device(0x1234, 0x5678).is_none());
    }

    #[test]
    fn test_device_id_display() {
        let id = DeviceId {
            vendor: 0x0416,
            product: 0x5302,
        };
        assert_eq!(id.to_string(), "0416:5302");
    }
}
