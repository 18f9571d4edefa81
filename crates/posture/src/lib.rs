//! Real-time posture sensor pipeline.
//!
//! One producer thread reads the camera, hands each frame to an external
//! posture assessor and publishes the freshest [`FrameResult`] into a
//! latest-wins slot. Any number of viewer sessions each run a stream worker
//! draining that slot, and camera state transitions are broadcast to every
//! session.
//!
//! - `pipeline`: producer loop, camera recovery, heartbeat, slot, config.
//! - `viewers`: session registry, stream workers, status broadcast.
//! - `testing`: scripted collaborators and a manual clock for tests, behind
//!   the `testing` feature.

pub mod error;
pub mod pipeline;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod viewers;

pub use error::{DeliveryError, EncodeError, HeartbeatError, PipelineFault, ProcessingError};
pub use pipeline::{
    clock::{Clock, SystemClock},
    config::{CameraConfig, HeartbeatConfig, PipelineCliArgs, PipelineConfig, TelemetryOptions},
    data::{
        Assessment, CameraState, CameraStateCell, CameraStatus, FrameResult, PostureState,
        PostureUpdate, ViewerEvent,
    },
    heartbeat::{HeartbeatEmitter, HeartbeatSink, LoggingNotifier, NotifyMessage, SystemdNotifier},
    processor::{
        AbsentSubjectProcessor, DEFAULT_PROCESSOR_TIMEOUT, PostureProcessor, SubprocessProcessor,
    },
    recovery::{CameraRecoveryController, RecoveryPolicy, RecoveryTier},
    slot::{LatestSlot, SlotReader},
    supervisor::{Collaborators, IterationOutcome, PipelineHandle, PipelineSupervisor, RunSummary},
    telemetry,
};
pub use viewers::{
    broadcast::StatusBroadcaster,
    registry::{ClientSession, ClientSessionRegistry, SessionId, ViewerSink},
};
