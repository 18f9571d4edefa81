//! Producer loop: heartbeat, acquire, assess, publish, pace.
//!
//! The supervisor exclusively owns the camera. Acquisition faults go through
//! the [`CameraRecoveryController`]; assessor errors and panics are processing
//! faults. A panic anywhere else in an iteration is caught at the iteration
//! boundary, logged, and followed by a short pause. Nothing short of a stop
//! request ends the loop.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, CaptureSource, Frame};

use crate::{
    error::{PipelineFault, ProcessingError, panic_message},
    pipeline::{
        clock::Clock,
        config::PipelineConfig,
        data::{Assessment, CameraState, CameraStateCell, CameraStatus, FrameResult},
        encoding::FrameEncoder,
        heartbeat::{HeartbeatEmitter, HeartbeatSink, NotifyMessage},
        processor::PostureProcessor,
        recovery::{AcquisitionMode, CameraRecoveryController},
        slot::LatestSlot,
        telemetry,
    },
    viewers::{broadcast::StatusBroadcaster, registry::ClientSessionRegistry},
};

/// Upper bound on a single uninterrupted sleep.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// External pieces the producer drives.
pub struct Collaborators {
    pub camera: Box<dyn CaptureSource>,
    pub processor: Box<dyn PostureProcessor>,
    pub heartbeat: Box<dyn HeartbeatSink>,
    pub clock: Arc<dyn Clock>,
}

/// What one call to [`PipelineSupervisor::step`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    /// A result was put into the slot.
    Published {
        sequence: u64,
        transition: Option<CameraState>,
    },
    /// No frame; the loop waited `wait` as the recovery policy asked.
    AcquisitionFailed {
        transition: Option<CameraState>,
        wait: Duration,
    },
    /// The assessor failed on a good frame; nothing was published.
    ProcessingFailed { transition: Option<CameraState> },
    /// A collaborator panicked outside the assessor; the loop paused and
    /// carries on.
    Panicked,
    /// Stop was requested before the iteration began.
    Stopped,
}

impl IterationOutcome {
    /// Last camera state transition published during the iteration.
    pub fn transition(&self) -> Option<CameraState> {
        match self {
            IterationOutcome::Published { transition, .. }
            | IterationOutcome::AcquisitionFailed { transition, .. }
            | IterationOutcome::ProcessingFailed { transition } => *transition,
            IterationOutcome::Panicked | IterationOutcome::Stopped => None,
        }
    }
}

/// Totals reported when the loop exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub published: u64,
    pub acquisition_faults: u64,
    pub processing_faults: u64,
    pub panics: u64,
}

pub struct PipelineSupervisor {
    camera: Box<dyn CaptureSource>,
    processor: Box<dyn PostureProcessor>,
    recovery: CameraRecoveryController,
    heartbeat: HeartbeatEmitter,
    encoder: FrameEncoder,
    frames: LatestSlot<FrameResult>,
    camera_state: Arc<CameraStateCell>,
    broadcaster: StatusBroadcaster,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    frame_period: Duration,
    fault_pause: Duration,
    wait_slice: Duration,
    next_sequence: u64,
    /// Consecutive processing faults; only the first of a streak is a warning.
    fault_streak: u64,
    summary: RunSummary,
}

impl PipelineSupervisor {
    pub fn new(
        config: &PipelineConfig,
        collaborators: Collaborators,
        registry: &ClientSessionRegistry,
    ) -> Self {
        let recovery = CameraRecoveryController::new(config.recovery);
        let camera_state = Arc::clone(registry.camera_state());
        camera_state.set(recovery.state());
        let frames = registry.frames().clone();
        let next_sequence = frames.sequence();

        Self {
            camera: collaborators.camera,
            processor: collaborators.processor,
            recovery,
            heartbeat: HeartbeatEmitter::new(collaborators.heartbeat, config.heartbeat.interval),
            encoder: FrameEncoder::new(config.jpeg_quality),
            frames,
            camera_state,
            broadcaster: StatusBroadcaster::new(registry.clone()),
            clock: collaborators.clock,
            stop: Arc::new(AtomicBool::new(false)),
            frame_period: config.frame_period(),
            fault_pause: config.fault_pause,
            wait_slice: config.heartbeat.interval.min(STOP_POLL_INTERVAL),
            next_sequence,
            fault_streak: 0,
            summary: RunSummary::default(),
        }
    }

    /// Flag that ends the loop when set.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> CameraState {
        self.recovery.state()
    }

    pub fn recovery(&self) -> &CameraRecoveryController {
        &self.recovery
    }

    pub fn heartbeat(&self) -> &HeartbeatEmitter {
        &self.heartbeat
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run exactly one iteration of the producer loop.
    pub fn step(&mut self) -> IterationOutcome {
        if self.stop_requested() {
            return IterationOutcome::Stopped;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| self.iterate())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                self.summary.panics += 1;
                metrics::counter!("posture_iteration_panics_total").increment(1);
                error!(
                    "producer iteration panicked: {}",
                    panic_message(payload.as_ref())
                );
                self.pace(self.fault_pause);
                IterationOutcome::Panicked
            }
        }
    }

    fn iterate(&mut self) -> IterationOutcome {
        let started = self.clock.now();
        self.heartbeat.maybe_beat(started);
        self.summary.iterations += 1;

        let span = tracing::info_span!(
            "pipeline.iteration",
            state = %self.recovery.state(),
            sequence = tracing::field::Empty
        );
        let _guard = span.enter();

        let frame = match self.acquire() {
            Ok(frame) => frame,
            Err(err) => return self.on_acquisition_fault(err),
        };
        let mut transition = self.recovery.on_acquisition_success();
        if let Some(state) = transition {
            self.publish_state(state);
        }

        let assessment = match self.assess(&frame) {
            Ok(assessment) => assessment,
            Err(err) => {
                self.summary.processing_faults += 1;
                self.fault_streak += 1;
                metrics::counter!("posture_processing_faults_total").increment(1);
                if self.fault_streak == 1 {
                    warn!("{}", PipelineFault::from(err));
                } else {
                    debug!(streak = self.fault_streak, "{}", PipelineFault::from(err));
                }
                if let Some(state) = self.recovery.on_processing_fault() {
                    self.publish_state(state);
                    transition = Some(state);
                }
                self.pace(self.fault_pause);
                return IterationOutcome::ProcessingFailed { transition };
            }
        };
        if self.fault_streak > 0 {
            info!(faults = self.fault_streak, "assessor recovered");
            self.fault_streak = 0;
        }
        if let Some(state) = self.recovery.on_processing_success() {
            self.publish_state(state);
            transition = Some(state);
        }

        let sequence = self.publish_result(&frame, assessment);
        span.record("sequence", sequence);
        let busy = self.clock.now().saturating_duration_since(started);
        metrics::histogram!("posture_iteration_seconds").record(busy.as_secs_f64());

        self.pace(self.frame_period.saturating_sub(busy));
        IterationOutcome::Published {
            sequence,
            transition,
        }
    }

    /// Loop until stopped, then release the camera and wake the readers.
    pub fn run(mut self) -> RunSummary {
        info!(camera = %self.camera.describe(), "posture pipeline started");
        metrics::gauge!("posture_camera_state").set(self.recovery.state().gauge_value());
        self.heartbeat.notify(NotifyMessage::Ready);

        while self.step() != IterationOutcome::Stopped {}

        self.heartbeat.notify(NotifyMessage::Stopping);
        self.camera.close();
        self.frames.close();
        info!(
            iterations = self.summary.iterations,
            published = self.summary.published,
            acquisition_faults = self.summary.acquisition_faults,
            processing_faults = self.summary.processing_faults,
            panics = self.summary.panics,
            "posture pipeline stopped"
        );
        self.summary
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> io::Result<PipelineHandle> {
        let stop = self.stop_signal();
        let camera_state = Arc::clone(&self.camera_state);
        let frames = self.frames.clone();
        let thread = telemetry::spawn_thread("posture-producer", move || self.run())?;
        Ok(PipelineHandle {
            stop,
            thread: Some(thread),
            camera_state,
            frames,
        })
    }

    fn acquire(&mut self) -> Result<Frame, CaptureError> {
        match self.recovery.next_acquisition() {
            AcquisitionMode::Read => self.camera.read(),
            AcquisitionMode::Reopen(tier) => {
                metrics::counter!("posture_camera_reopen_attempts_total", "tier" => tier.label())
                    .increment(1);
                debug!(tier = tier.label(), camera = %self.camera.describe(), "reopening camera");
                self.camera.close();
                self.camera.open()?;
                self.camera.read()
            }
        }
    }

    fn on_acquisition_fault(&mut self, err: CaptureError) -> IterationOutcome {
        self.summary.acquisition_faults += 1;
        metrics::counter!("posture_acquisition_faults_total").increment(1);
        let step = self.recovery.on_acquisition_failure();
        let episode = self.recovery.episode();
        warn!(
            tier = episode.map(|e| e.tier.label()).unwrap_or("none"),
            failures = episode.map(|e| e.failures).unwrap_or_default(),
            retry_in = %humantime::format_duration(step.wait),
            "{}",
            PipelineFault::from(err)
        );
        if let Some(state) = step.transition {
            self.publish_state(state);
        }
        self.pace(step.wait);
        IterationOutcome::AcquisitionFailed {
            transition: step.transition,
            wait: step.wait,
        }
    }

    fn assess(&mut self, frame: &Frame) -> Result<Assessment, ProcessingError> {
        let processor = &mut self.processor;
        match panic::catch_unwind(AssertUnwindSafe(|| processor.process(frame))) {
            Ok(result) => result.map(Assessment::normalized),
            Err(payload) => Err(ProcessingError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    fn publish_result(&mut self, frame: &Frame, assessment: Assessment) -> u64 {
        let encoded_image = match self.encoder.encode(frame) {
            Ok(jpeg) => Some(jpeg),
            Err(err) => {
                debug!("frame not encoded: {err}");
                None
            }
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let result = FrameResult {
            sequence: self.next_sequence,
            captured_at: Utc::now(),
            posture: assessment.posture,
            presence: assessment.presence,
            confidence: assessment.confidence,
            encoded_image,
            camera_state: self.recovery.state(),
            frame_size: (frame.width, frame.height),
        };
        self.frames.put(result);
        self.summary.published += 1;
        metrics::counter!("posture_frames_total").increment(1);
        self.next_sequence
    }

    fn publish_state(&mut self, state: CameraState) {
        let previous = self.camera_state.get();
        self.camera_state.set(state);
        metrics::gauge!("posture_camera_state").set(state.gauge_value());
        info!(from = %previous, to = %state, "camera state changed");
        self.heartbeat
            .notify(NotifyMessage::Status(format!("camera {state}")));
        self.broadcaster.broadcast(CameraStatus::now(state));
    }

    /// Wait `total` in slices, offering a heartbeat and checking the stop
    /// flag before each one. Returns `false` if interrupted by a stop.
    fn pace(&mut self, total: Duration) -> bool {
        let deadline = self.clock.now() + total;
        loop {
            if self.stop_requested() {
                return false;
            }
            let now = self.clock.now();
            self.heartbeat.maybe_beat(now);
            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                return true;
            }
            self.clock.sleep(remaining.min(self.wait_slice));
        }
    }
}

/// Control handle for a producer running on its own thread.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<RunSummary>>,
    camera_state: Arc<CameraStateCell>,
    frames: LatestSlot<FrameResult>,
}

impl PipelineHandle {
    pub fn state(&self) -> CameraState {
        self.camera_state.get()
    }

    pub fn frames(&self) -> &LatestSlot<FrameResult> {
        &self.frames
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|thread| thread.is_finished())
    }

    /// Ask the loop to stop without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Request a stop and wait up to `timeout` for the producer thread.
    /// Returns `false` if it was still running at the deadline.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if !thread.is_finished() {
            warn!(
                "producer thread still running after {}",
                humantime::format_duration(timeout)
            );
            self.thread = Some(thread);
            return false;
        }
        match thread.join() {
            Ok(summary) => debug!(?summary, "producer thread joined"),
            Err(_) => warn!("producer thread panicked"),
        }
        true
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.request_stop();
    }
}
