//! Camera capture sources.
//!
//! Every backend implements [`CaptureSource`], a pull-based handle with an
//! explicit open/read/close lifecycle so the owner can reopen the device
//! after a fault:
//! - `ffmpeg`: spawns `ffmpeg` and reads raw BGR24 frames from its stdout.
//! - `camera`: OpenCV `VideoCapture` (behind the `opencv` feature).

#[cfg(feature = "opencv")]
mod camera;
mod device;
mod ffmpeg;
mod types;

#[cfg(feature = "opencv")]
pub use camera::OpenCvCapture;
pub use device::parse_device_index;
pub use ffmpeg::{FfmpegCapture, FfmpegOptions};
pub use types::{CaptureError, CaptureSource, Frame, FrameFormat};
