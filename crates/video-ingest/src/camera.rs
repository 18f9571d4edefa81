//! OpenCV-backed camera capture.

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{
    device::parse_device_index,
    types::{CaptureError, CaptureSource, Frame, FrameFormat},
};

/// Camera handle owning an OpenCV `VideoCapture`.
pub struct OpenCvCapture {
    uri: String,
    target_size: (i32, i32),
    fps: f64,
    cap: Option<VideoCapture>,
    frame: Mat,
    scratch: Mat,
}

impl OpenCvCapture {
    pub fn new(uri: impl Into<String>, target_size: (i32, i32), fps: u32) -> Self {
        Self {
            uri: uri.into(),
            target_size,
            fps: f64::from(fps),
            cap: None,
            frame: Mat::default(),
            scratch: Mat::default(),
        }
    }
}

impl CaptureSource for OpenCvCapture {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.close();
        let mut cap = open_video_capture(&self.uri)?;
        configure_camera(&mut cap, self.target_size, self.fps);
        self.cap = Some(cap);
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        let cap = self.cap.as_mut().ok_or(CaptureError::Closed)?;
        let grabbed = cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Err(CaptureError::NoFrame);
        }

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::NoFrame);
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn close(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            let _ = cap.release();
        }
    }

    fn describe(&self) -> String {
        let (width, height) = self.target_size;
        format!("opencv:{} ({width}x{height})", self.uri)
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
    // Keep the driver queue short so reads return the current scene.
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
}
