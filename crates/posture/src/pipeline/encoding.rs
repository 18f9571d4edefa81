//! JPEG encoding of captured frames for viewers.

use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};
use video_ingest::{Frame, FrameFormat};

use crate::error::EncodeError;

#[derive(Clone, Copy, Debug)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EncodeError> {
        let expected = Frame::expected_len(frame.width, frame.height, frame.format);
        if frame.width <= 0 || frame.height <= 0 || frame.data.len() != expected {
            return Err(EncodeError::Geometry {
                expected,
                actual: frame.data.len(),
            });
        }

        let rgb = match frame.format {
            FrameFormat::Bgr8 => frame
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect::<Vec<u8>>(),
        };
        let image: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(frame.width as u32, frame.height as u32, rgb).ok_or(
                EncodeError::Geometry {
                    expected,
                    actual: frame.data.len(),
                },
            )?;

        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, self.quality).encode_image(&image)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![40; Frame::expected_len(width, height, FrameFormat::Bgr8)],
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn encodes_jpeg() {
        let jpeg = FrameEncoder::new(80).encode(&frame(16, 8)).expect("jpeg");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn dark_frame_still_encodes() {
        let mut dark = frame(8, 8);
        dark.data.fill(0);
        assert!(FrameEncoder::new(80).encode(&dark).is_ok());
    }

    #[test]
    fn rejects_truncated_buffer() {
        let mut broken = frame(8, 8);
        broken.data.truncate(10);
        assert!(matches!(
            FrameEncoder::new(80).encode(&broken),
            Err(EncodeError::Geometry { expected: 192, actual: 10 })
        ));
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(FrameEncoder::new(0).quality(), 1);
        assert_eq!(FrameEncoder::new(255).quality(), 100);
    }
}
