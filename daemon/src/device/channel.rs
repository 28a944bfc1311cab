use super::{Link, REPLY_TIMEOUT, TransportError};
use common::Protocol;
use common::protocol::{Handshake, REPLY_MAX_LEN, REPORT_BLOCK_SIZE, split_reports};
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage, RgbaImage};

/// Default JPEG quality for frames sent to a panel
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Encode an image as baseline JPEG, dropping the alpha channel.
pub fn encode_jpeg(image: &RgbaImage, quality: u8) -> Result<Vec<u8>, TransportError> {
    let rgb: RgbImage = image.convert();
    let mut jpeg = Vec::with_capacity(rgb.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| TransportError::Encode(e.to_string()))?;
    Ok(jpeg)
}

/// Streams composited frames to one panel.
pub struct DeviceChannel {
    link: Box<dyn Link>,
    protocol: Protocol,
    quality: u8,
    handshake: Handshake,
}

impl DeviceChannel {
    /// Perform the capability handshake on a freshly opened link.
    pub fn open(
        mut link: Box<dyn Link>,
        protocol: Protocol,
        quality: u8,
    ) -> Result<Self, TransportError> {
        write_message(link.as_mut(), protocol, &protocol.probe())?;
        let reply = read_reply(link.as_mut(), protocol)?;
        let handshake = protocol.parse_reply(&reply)?;

        if !handshake.is_reply() {
            log::warn!(
                "Unexpected handshake reply type {:#010x}",
                handshake.command_type
            );
        }
        log::debug!(
            "Handshake reply ({} bytes): {:02x?}",
            reply.len(),
            &reply[..reply.len().min(32)]
        );

        Ok(Self {
            link,
            protocol,
            quality,
            handshake,
        })
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Encode and transmit one frame.
    pub fn send(&mut self, image: &RgbaImage) -> Result<(), TransportError> {
        let jpeg = encode_jpeg(image, self.quality)?;
        let message = self
            .protocol
            .frame_message(image.width(), image.height(), &jpeg);
        write_message(self.link.as_mut(), self.protocol, &message)
    }
}

fn write_all(link: &mut dyn Link, data: &[u8]) -> Result<(), TransportError> {
    let written = link.write(data)?;
    if written < data.len() {
        return Err(TransportError::ShortWrite {
            written,
            expected: data.len(),
        });
    }
    Ok(())
}

fn write_message(link: &mut dyn Link, protocol: Protocol, message: &[u8]) -> Result<(), TransportError> {
    match protocol {
        Protocol::Bulk => write_all(link, message),
        Protocol::Report => split_reports(message)
            .iter()
            .try_for_each(|report| write_all(link, report)),
    }
}

fn read_reply(link: &mut dyn Link, protocol: Protocol) -> Result<Vec<u8>, TransportError> {
    match protocol {
        Protocol::Bulk => {
            let mut buf = vec![0u8; REPLY_MAX_LEN];
            let len = link.read(&mut buf, REPLY_TIMEOUT)?;
            buf.truncate(len);
            Ok(buf)
        }
        // Reports keep arriving until the reply is drained
        Protocol::Report => {
            let mut reply = Vec::new();
            let mut buf = vec![0u8; REPORT_BLOCK_SIZE];
            while reply.len() < REPLY_MAX_LEN {
                let len = link.read(&mut buf, REPLY_TIMEOUT)?;
                if len == 0 {
                    break;
                }
                reply.extend_from_slice(&buf[..len]);
            }
            Ok(reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::protocol::{BULK_MAGIC, BULK_PROBE_LEN, REPORT_MAGIC};
    use image::{ImageBuffer, Rgba};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct MockLink {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    }

    impl MockLink {
        fn with_replies(replies: Vec<Vec<u8>>) -> Self {
            let link = Self::default();
            link.replies.lock().unwrap().extend(replies);
            link
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }
    }

    impl Link for MockLink {
        fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            self.written.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
            match self.replies.lock().unwrap().pop_front() {
                Some(reply) => {
                    let len = reply.len().min(buf.len());
                    buf[..len].copy_from_slice(&reply[..len]);
                    Ok(len)
                }
                None => Ok(0),
            }
        }
    }

    fn bulk_reply() -> Vec<u8> {
        let mut reply = BULK_MAGIC.to_vec();
        reply.extend_from_slice(b"SSCRM-V1");
        reply.resize(64, 0);
        reply
    }

    fn report_reply() -> Vec<u8> {
        let mut reply = REPORT_MAGIC.to_vec();
        reply.extend_from_slice(&1u32.to_le_bytes());
        reply.extend_from_slice(b"BP21940");
        reply
    }

    fn image() -> RgbaImage {
        ImageBuffer::from_pixel(16, 8, Rgba([200, 100, 50, 255]))
    }

    #[test]
    fn test_jpeg_starts_with_soi() {
        let jpeg = encode_jpeg(&image(), DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_bulk_handshake_and_frame() {
        let link = MockLink::with_replies(vec![bulk_reply()]);
        let mut channel =
            DeviceChannel::open(Box::new(link.clone()), Protocol::Bulk, DEFAULT_JPEG_QUALITY)
                .unwrap();
        channel.send(&image()).unwrap();

        let written = link.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].len(), BULK_PROBE_LEN);
        assert_eq!(&written[0][..4], &BULK_MAGIC);

        let frame = &written[1];
        assert_eq!(&frame[4..8], &2u32.to_le_bytes());
        assert_eq!(&frame[8..12], &16u32.to_le_bytes());
        assert_eq!(&frame[12..16], &8u32.to_le_bytes());
        let len = u32::from_le_bytes([frame[52], frame[53], frame[54], frame[55]]) as usize;
        assert_eq!(frame.len(), 56 + len);
        assert_eq!(&frame[56..58], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_report_handshake_and_frame_are_chunked() {
        let link = MockLink::with_replies(vec![report_reply()]);
        let mut channel =
            DeviceChannel::open(Box::new(link.clone()), Protocol::Report, DEFAULT_JPEG_QUALITY)
                .unwrap();
        assert!(channel.handshake().is_reply());
        assert_eq!(channel.handshake().ident_string(), "BP21940");

        channel.send(&image()).unwrap();

        let written = link.written();
        assert!(written.iter().all(|r| r.len() == REPORT_BLOCK_SIZE + 1 && r[0] == 0));
        assert_eq!(&written[0][1..5], &REPORT_MAGIC);
        assert_eq!(&written[1][1..5], &REPORT_MAGIC);
        assert_eq!(&written[1][21..23], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_bad_magic_fails_open() {
        let mut reply = bulk_reply();
        reply[0] = 0;
        let link = MockLink::with_replies(vec![reply]);

        let result = DeviceChannel::open(Box::new(link), Protocol::Bulk, DEFAULT_JPEG_QUALITY);
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[test]
    fn test_missing_reply_fails_open() {
        let link = MockLink::default();
        let result = DeviceChannel::open(Box::new(link), Protocol::Report, DEFAULT_JPEG_QUALITY);
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    struct ShortLink;

    impl Link for ShortLink {
        fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            Ok(data.len() / 2)
        }

        fn read(&mut self, _buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
            Ok(0)
        }
    }

    #[test]
    fn test_short_write_is_an_error() {
        let result = DeviceChannel::open(Box::new(ShortLink), Protocol::Bulk, DEFAULT_JPEG_QUALITY);
        assert!(matches!(result, Err(TransportError::ShortWrite { .. })));
    }
}
