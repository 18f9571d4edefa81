use std::time::Duration;

use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Number of bytes a tightly packed frame of this geometry occupies.
    pub fn expected_len(width: i32, height: i32, format: FrameFormat) -> usize {
        (width.max(0) as usize) * (height.max(0) as usize) * format.bytes_per_pixel()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FrameFormat::Bgr8 => "bgr8",
        }
    }
}

/// Acquisition-layer failure. Every variant means the device did not hand
/// back a frame; unusable-but-present frames are never reported here.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source returned no frame")]
    NoFrame,
    #[error("no frame within {waited:?}")]
    Timeout { waited: Duration },
    #[error("video source is closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] Error),
}

/// Pull-based camera handle driven by a single owner.
///
/// `open` may be called again after `close` (or after a failed `read`) to
/// reacquire the device.
pub trait CaptureSource: Send {
    fn open(&mut self) -> Result<(), CaptureError>;

    fn read(&mut self) -> Result<Frame, CaptureError>;

    fn close(&mut self);

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

impl<T: CaptureSource + ?Sized> CaptureSource for Box<T> {
    fn open(&mut self) -> Result<(), CaptureError> {
        (**self).open()
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        (**self).read()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
