use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Posture classification reported by the assessor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostureState {
    Good,
    Bad,
    /// No subject was confidently present.
    Unknown,
}

/// Camera health as tracked by the recovery state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraState {
    Connected,
    Degraded,
    Disconnected,
}

impl CameraState {
    pub fn label(self) -> &'static str {
        match self {
            CameraState::Connected => "connected",
            CameraState::Degraded => "degraded",
            CameraState::Disconnected => "disconnected",
        }
    }

    /// Gauge value exported to Prometheus.
    pub(crate) fn gauge_value(self) -> f64 {
        match self {
            CameraState::Disconnected => 0.0,
            CameraState::Degraded => 1.0,
            CameraState::Connected => 2.0,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            CameraState::Connected => 0,
            CameraState::Degraded => 1,
            CameraState::Disconnected => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CameraState::Connected,
            1 => CameraState::Degraded,
            _ => CameraState::Disconnected,
        }
    }
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Published camera state. Written only by the producer thread, read by
/// anyone without locking.
#[derive(Debug)]
pub struct CameraStateCell {
    raw: AtomicU8,
}

impl CameraStateCell {
    pub fn new(initial: CameraState) -> Self {
        Self {
            raw: AtomicU8::new(initial.to_u8()),
        }
    }

    pub fn get(&self) -> CameraState {
        CameraState::from_u8(self.raw.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: CameraState) {
        self.raw.store(state.to_u8(), Ordering::Release);
    }
}

impl Default for CameraStateCell {
    fn default() -> Self {
        Self::new(CameraState::Disconnected)
    }
}

/// Output of one assessor invocation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Assessment {
    pub presence: bool,
    pub posture: PostureState,
    pub confidence: f32,
}

impl Assessment {
    /// Assessment used when nobody is in front of the camera.
    pub fn absent() -> Self {
        Self {
            presence: false,
            posture: PostureState::Unknown,
            confidence: 0.0,
        }
    }

    /// Clamp confidence into `[0, 1]`, mapping NaN to zero.
    pub fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        };
        self
    }
}

/// Immutable result of one producer iteration.
#[derive(Clone, Debug)]
pub struct FrameResult {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub posture: PostureState,
    pub presence: bool,
    pub confidence: f32,
    /// JPEG bytes; absent when encoding failed.
    pub encoded_image: Option<Vec<u8>>,
    /// Camera state at capture time.
    pub camera_state: CameraState,
    pub frame_size: (i32, i32),
}

/// Wire form of a [`FrameResult`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostureUpdate {
    pub sequence: u64,
    pub captured_at_ms: i64,
    pub posture_state: PostureState,
    pub presence: bool,
    pub confidence: f32,
    /// Base64 encoded JPEG.
    pub encoded_image: Option<String>,
    pub camera_state: CameraState,
}

impl From<&FrameResult> for PostureUpdate {
    fn from(result: &FrameResult) -> Self {
        Self {
            sequence: result.sequence,
            captured_at_ms: result.captured_at.timestamp_millis(),
            posture_state: result.posture,
            presence: result.presence,
            confidence: result.confidence,
            encoded_image: result.encoded_image.as_ref().map(|jpeg| STANDARD.encode(jpeg)),
            camera_state: result.camera_state,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub state: CameraState,
    pub timestamp_ms: i64,
}

impl CameraStatus {
    pub fn now(state: CameraState) -> Self {
        Self {
            state,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Event pushed to a viewer session.
#[derive(Clone, Debug)]
pub enum ViewerEvent {
    /// Freshest result, delivered only to the session that drained it.
    PostureUpdate(Arc<FrameResult>),
    /// Camera transition, delivered to every session.
    CameraStatus(CameraStatus),
}

impl ViewerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ViewerEvent::PostureUpdate(_) => "posture_update",
            ViewerEvent::CameraStatus(_) => "camera_status",
        }
    }

    /// JSON payload of the event, without the event name.
    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            ViewerEvent::PostureUpdate(result) => {
                serde_json::to_string(&PostureUpdate::from(result.as_ref()))
            }
            ViewerEvent::CameraStatus(status) => serde_json::to_string(status),
        }
    }
}
