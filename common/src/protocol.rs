//! Wire framing for the supported USB panel families.
//!
//! Two families exist:
//!
//! - [`Protocol::Bulk`]: bulk-endpoint panels. A 64-byte capability probe is
//!   exchanged before streaming; every frame is sent as one message.
//! - [`Protocol::Report`]: HID panels. Messages are split into 512-byte
//!   reports, each prefixed with a zero report id; the last report is padded.
//!
//! All integers on the wire are little-endian.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic prefix of every bulk-family message.
pub const BULK_MAGIC: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

/// Magic prefix of every report-family message.
pub const REPORT_MAGIC: [u8; 4] = [0xDA, 0xDB, 0xDC, 0xDD];

/// Size of the bulk-family capability probe.
pub const BULK_PROBE_LEN: usize = 64;

/// Maximum size of a handshake reply.
pub const REPLY_MAX_LEN: usize = 128;

/// Payload size of one HID report.
pub const REPORT_BLOCK_SIZE: usize = 512;

/// Report id prepended to every HID block.
pub const REPORT_ID: u8 = 0x00;

/// Reserved zero bytes between the geometry and the sub-type of a bulk frame.
pub const BULK_RESERVED_LEN: usize = 32;

const CMD_PROBE: u32 = 0x00;
const CMD_REPLY: u32 = 0x01;
const CMD_FRAME: u32 = 0x02;
const SUBTYPE_JPEG: u32 = 0x02;

/// Offset of the capability flag inside the bulk probe.
const BULK_PROBE_FLAG_OFFSET: usize = 56;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Handshake reply too short ({len} bytes)")]
    ShortReply { len: usize },

    #[error("Handshake reply has wrong magic {found:02x?}")]
    BadMagic { found: [u8; 4] },
}

/// Device family, selecting probe, framing and block splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Bulk-endpoint family (protocol A)
    Bulk,
    /// Chunked HID report family (protocol B)
    Report,
}

/// Parsed handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Command type found at offset 4
    pub command_type: u32,
    /// Identification bytes following the command type
    pub ident: Vec<u8>,
}

impl Handshake {
    /// Whether the reply carries the documented reply command type.
    pub fn is_reply(&self) -> bool {
        self.command_type == CMD_REPLY
    }

    /// Printable part of the identification bytes.
    pub fn ident_string(&self) -> String {
        self.ident
            .iter()
            .take_while(|b| **b != 0)
            .filter(|b| b.is_ascii_graphic() || **b == b' ')
            .map(|b| *b as char)
            .collect()
    }
}

impl Protocol {
    pub fn magic(self) -> [u8; 4] {
        match self {
            Protocol::Bulk => BULK_MAGIC,
            Protocol::Report => REPORT_MAGIC,
        }
    }

    /// Capability probe written once after the transport is opened.
    pub fn probe(self) -> Vec<u8> {
        match self {
            Protocol::Bulk => {
                let mut probe = vec![0u8; BULK_PROBE_LEN];
                probe[..4].copy_from_slice(&BULK_MAGIC);
                probe[4..8].copy_from_slice(&CMD_PROBE.to_le_bytes());
                probe[BULK_PROBE_FLAG_OFFSET] = 0x01;
                probe
            }
            Protocol::Report => {
                let mut probe = Vec::with_capacity(16);
                probe.extend_from_slice(&REPORT_MAGIC);
                probe.extend_from_slice(&CMD_PROBE.to_le_bytes());
                probe.extend_from_slice(&0u32.to_le_bytes());
                probe.extend_from_slice(&1u32.to_le_bytes());
                probe
            }
        }
    }

    /// Check the magic of a handshake reply and split out its fields.
    pub fn parse_reply(self, reply: &[u8]) -> Result<Handshake, ProtocolError> {
        if reply.len() < 8 {
            return Err(ProtocolError::ShortReply { len: reply.len() });
        }

        let mut found = [0u8; 4];
        found.copy_from_slice(&reply[..4]);
        if found != self.magic() {
            return Err(ProtocolError::BadMagic { found });
        }

        let command_type = u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]);
        Ok(Handshake {
            command_type,
            ident: reply[8..].to_vec(),
        })
    }

    /// Frame message carrying an encoded image.
    ///
    /// Geometry is only part of the bulk-family header; the report family
    /// carries four reserved bytes in its place.
    pub fn frame_message(self, width: u32, height: u32, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        match self {
            Protocol::Bulk => {
                let mut message = Vec::with_capacity(56 + payload.len());
                message.extend_from_slice(&BULK_MAGIC);
                message.extend_from_slice(&CMD_FRAME.to_le_bytes());
                message.extend_from_slice(&width.to_le_bytes());
                message.extend_from_slice(&height.to_le_bytes());
                message.extend_from_slice(&[0u8; BULK_RESERVED_LEN]);
                message.extend_from_slice(&SUBTYPE_JPEG.to_le_bytes());
                message.extend_from_slice(&len.to_le_bytes());
                message.extend_from_slice(payload);
                message
            }
            Protocol::Report => {
                let mut message = Vec::with_capacity(20 + payload.len());
                message.extend_from_slice(&REPORT_MAGIC);
                message.extend_from_slice(&CMD_FRAME.to_le_bytes());
                message.extend_from_slice(&[0u8; 4]);
                message.extend_from_slice(&SUBTYPE_JPEG.to_le_bytes());
                message.extend_from_slice(&len.to_le_bytes());
                message.extend_from_slice(payload);
                message
            }
        }
    }
}

/// Split a message into HID reports of `1 + REPORT_BLOCK_SIZE` bytes.
///
/// An empty message still produces a single (all zero) report.
pub fn split_reports(message: &[u8]) -> Vec<Vec<u8>> {
    if message.is_empty() {
        return vec![vec![REPORT_ID; REPORT_BLOCK_SIZE + 1]];
    }

    message
        .chunks(REPORT_BLOCK_SIZE)
        .map(|chunk| {
            let mut report = Vec::with_capacity(REPORT_BLOCK_SIZE + 1);
            report.push(REPORT_ID);
            report.extend_from_slice(chunk);
            report.resize(REPORT_BLOCK_SIZE + 1, 0);
            report
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_probe_layout() {
        let probe = Protocol::Bulk.probe();
        assert_eq!(probe.len(), 64);
        assert_eq!(&probe[..4], &BULK_MAGIC);
        assert_eq!(&probe[4..8], &[0, 0, 0, 0]);
        assert_eq!(probe[56], 0x01);
        assert_eq!(probe.iter().filter(|b| **b != 0).count(), 5);
    }

    #[test]
    fn test_report_probe_layout() {
        let probe = Protocol::Report.probe();
        assert_eq!(
            probe,
            vec![
                0xDA, 0xDB, 0xDC, 0xDD, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0
            ]
        );
    }

    #[test]
    fn test_bulk_frame_length_and_header() {
        let payload = vec![0xAB; 1000];
        let message = Protocol::Bulk.frame_message(480, 480, &payload);

        assert_eq!(message.len(), 8 + 4 + 4 + 32 + 4 + 4 + payload.len());
        assert_eq!(&message[..8], &[0x12, 0x34, 0x56, 0x78, 2, 0, 0, 0]);
        assert_eq!(&message[8..12], &480u32.to_le_bytes());
        assert_eq!(&message[12..16], &480u32.to_le_bytes());
        assert!(message[16..48].iter().all(|b| *b == 0));
        assert_eq!(&message[48..52], &[2, 0, 0, 0]);
        assert_eq!(&message[52..56], &1000u32.to_le_bytes());
        assert_eq!(&message[56..], payload.as_slice());
    }

    #[test]
    fn test_report_frame_header() {
        let payload = [1u8, 2, 3];
        let message = Protocol::Report.frame_message(320, 240, &payload);

        assert_eq!(message.len(), 20 + 3);
        assert_eq!(&message[..4], &REPORT_MAGIC);
        assert_eq!(&message[4..8], &[2, 0, 0, 0]);
        assert_eq!(&message[8..12], &[0, 0, 0, 0]);
        assert_eq!(&message[12..16], &[2, 0, 0, 0]);
        assert_eq!(&message[16..20], &3u32.to_le_bytes());
        assert_eq!(&message[20..], &payload);
    }

    #[test]
    fn test_split_reports_pads_last_block() {
        let message = vec![0x55; 1100];
        let reports = split_reports(&message);

        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert_eq!(report.len(), 513);
            assert_eq!(report[0], REPORT_ID);
        }
        assert!(reports[1][1..].iter().all(|b| *b == 0x55));
        // 1100 - 1024 = 76 payload bytes in the last block
        assert!(reports[2][1..77].iter().all(|b| *b == 0x55));
        assert!(reports[2][77..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_split_reports_exact_multiple() {
        let reports = split_reports(&[0x11; 1024]);
        assert_eq!(reports.len(), 2);
        assert!(reports[1][1..].iter().all(|b| *b == 0x11));
    }

    #[test]
    fn test_parse_reply() {
        let mut reply = vec![0xDA, 0xDB, 0xDC, 0xDD, 0x01, 0x00, 0x00, 0x00];
        reply.extend_from_slice(b"LCD-V1\0\0");

        let handshake = Protocol::Report.parse_reply(&reply).unwrap();
        assert!(handshake.is_reply());
        assert_eq!(handshake.ident_string(), "LCD-V1");

        let err = Protocol::Bulk.parse_reply(&reply).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::BadMagic {
                found: [0xDA, 0xDB, 0xDC, 0xDD]
            }
        );

        assert_eq!(
            Protocol::Bulk.parse_reply(&[0x12, 0x34]),
            Err(ProtocolError::ShortReply { len: 2 })
        );
    }
}
