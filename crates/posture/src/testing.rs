//! Deterministic collaborators for exercising the pipeline without hardware.
//!
//! [`ManualClock`] makes every sleep instantaneous while advancing virtual
//! time, so recovery delays and heartbeat cadence can be asserted exactly.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use video_ingest::{CaptureError, CaptureSource, Frame, FrameFormat};

use crate::{
    error::{DeliveryError, HeartbeatError, ProcessingError},
    pipeline::{
        clock::Clock,
        data::{Assessment, CameraState, ViewerEvent},
        heartbeat::{HeartbeatSink, NotifyMessage},
        processor::PostureProcessor,
    },
    viewers::registry::ViewerSink,
};

struct ClockState {
    now: Instant,
    sleeps: Vec<Duration>,
}

/// Virtual clock: `sleep` returns immediately and moves time forward.
#[derive(Clone)]
pub struct ManualClock {
    start: Instant,
    state: Arc<Mutex<ClockState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let start = Instant::now();
        Self {
            start,
            state: Arc::new(Mutex::new(ClockState {
                now: start,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Virtual time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().now.saturating_duration_since(self.start)
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        self.state.lock().now += by;
    }

    /// Every non-zero sleep requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }

    /// Sum of all requested sleeps.
    pub fn slept(&self) -> Duration {
        self.state.lock().sleeps.iter().sum()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.state.lock().now
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let mut state = self.state.lock();
        state.now += duration;
        state.sleeps.push(duration);
    }
}

/// Outcome of one scripted device read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquisition {
    Ok,
    Fail,
    /// The device driver panics inside `read`.
    Panic,
}

/// One call the pipeline made on a [`ScriptedCapture`], stamped with the
/// virtual time at which it happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureCall {
    Open { at: Duration },
    Read { at: Duration, ok: bool },
    Close { at: Duration },
}

/// Shared view of a [`ScriptedCapture`]'s call log.
#[derive(Clone, Default)]
pub struct CaptureLog(Arc<Mutex<Vec<CaptureCall>>>);

impl CaptureLog {
    pub fn calls(&self) -> Vec<CaptureCall> {
        self.0.lock().clone()
    }

    /// Virtual times of every `open` call.
    pub fn opens(&self) -> Vec<Duration> {
        self.0
            .lock()
            .iter()
            .filter_map(|call| match call {
                CaptureCall::Open { at } => Some(*at),
                _ => None,
            })
            .collect()
    }

    pub fn reads(&self) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|call| matches!(call, CaptureCall::Read { .. }))
            .count()
    }

    pub fn closes(&self) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|call| matches!(call, CaptureCall::Close { .. }))
            .count()
    }

    fn push(&self, call: CaptureCall) {
        self.0.lock().push(call);
    }
}

/// Camera whose reads follow a script. `open` always succeeds; each `read`
/// consumes the next scripted outcome, then repeats the fallback outcome
/// once the script runs out.
pub struct ScriptedCapture {
    script: VecDeque<Acquisition>,
    fallback: Acquisition,
    clock: ManualClock,
    log: CaptureLog,
    open: bool,
    size: (i32, i32),
}

impl ScriptedCapture {
    pub fn new(clock: ManualClock, script: impl IntoIterator<Item = Acquisition>) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: Acquisition::Ok,
            clock,
            log: CaptureLog::default(),
            open: false,
            size: (8, 6),
        }
    }

    /// Outcome of every read after the script is exhausted.
    pub fn then_always(mut self, outcome: Acquisition) -> Self {
        self.fallback = outcome;
        self
    }

    pub fn log(&self) -> CaptureLog {
        self.log.clone()
    }

    fn at(&self) -> Duration {
        self.clock.elapsed()
    }
}

impl CaptureSource for ScriptedCapture {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.log.push(CaptureCall::Open { at: self.at() });
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        if !self.open {
            return Err(CaptureError::Closed);
        }
        let outcome = self.script.pop_front().unwrap_or(self.fallback);
        let at = self.at();
        self.log.push(CaptureCall::Read {
            at,
            ok: outcome == Acquisition::Ok,
        });
        match outcome {
            Acquisition::Ok => {
                let (width, height) = self.size;
                Ok(Frame {
                    data: vec![90; Frame::expected_len(width, height, FrameFormat::Bgr8)],
                    width,
                    height,
                    timestamp_ms: at.as_millis() as i64,
                    format: FrameFormat::Bgr8,
                })
            }
            Acquisition::Fail => Err(CaptureError::NoFrame),
            Acquisition::Panic => panic!("scripted capture panic"),
        }
    }

    fn close(&mut self) {
        self.log.push(CaptureCall::Close { at: self.at() });
        self.open = false;
    }

    fn describe(&self) -> String {
        "scripted camera".to_string()
    }
}

/// Scripted assessor behaviour for one frame.
#[derive(Clone, Debug)]
pub enum ProcessorStep {
    Assess(Assessment),
    Fail(String),
    Panic(String),
}

/// Assessor that follows a script, then keeps returning the fallback
/// assessment.
pub struct ScriptedProcessor {
    script: VecDeque<ProcessorStep>,
    fallback: Assessment,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProcessor {
    pub fn new(script: impl IntoIterator<Item = ProcessorStep>) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: Assessment::absent(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn always(assessment: Assessment) -> Self {
        Self {
            fallback: assessment,
            ..Self::new([])
        }
    }

    /// Shared counter of `process` invocations.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl PostureProcessor for ScriptedProcessor {
    fn process(&mut self, _frame: &Frame) -> Result<Assessment, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front() {
            None => Ok(self.fallback),
            Some(ProcessorStep::Assess(assessment)) => Ok(assessment),
            Some(ProcessorStep::Fail(reason)) => Err(ProcessingError::Failed(anyhow::anyhow!(reason))),
            Some(ProcessorStep::Panic(reason)) => panic!("{reason}"),
        }
    }
}

/// Supervisor socket stand-in recording every notification with its virtual
/// time.
#[derive(Clone)]
pub struct RecordingHeartbeat {
    clock: ManualClock,
    messages: Arc<Mutex<Vec<(Duration, NotifyMessage)>>>,
}

impl RecordingHeartbeat {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn messages(&self) -> Vec<NotifyMessage> {
        self.messages.lock().iter().map(|(_, msg)| msg.clone()).collect()
    }

    /// Virtual times of every `WATCHDOG=1`.
    pub fn beat_times(&self) -> Vec<Duration> {
        self.messages
            .lock()
            .iter()
            .filter(|(_, msg)| *msg == NotifyMessage::Watchdog)
            .map(|(at, _)| *at)
            .collect()
    }
}

impl HeartbeatSink for RecordingHeartbeat {
    fn notify(&mut self, message: &NotifyMessage) -> Result<(), HeartbeatError> {
        self.messages
            .lock()
            .push((self.clock.elapsed(), message.clone()));
        Ok(())
    }
}

/// Viewer capturing every event it is sent; can be switched to reject them.
#[derive(Clone, Default)]
pub struct RecordingViewer {
    events: Arc<Mutex<Vec<ViewerEvent>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingViewer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A viewer whose every send fails with `DeliveryError::Closed`.
    pub fn failing() -> Self {
        let viewer = Self::default();
        viewer.set_failing(true);
        viewer
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ViewerEvent> {
        self.events.lock().clone()
    }

    pub fn camera_states(&self) -> Vec<CameraState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ViewerEvent::CameraStatus(status) => Some(status.state),
                ViewerEvent::PostureUpdate(_) => None,
            })
            .collect()
    }

    pub fn posture_sequences(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ViewerEvent::PostureUpdate(result) => Some(result.sequence),
                ViewerEvent::CameraStatus(_) => None,
            })
            .collect()
    }
}

impl ViewerSink for RecordingViewer {
    fn send(&self, event: &ViewerEvent) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Closed);
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}
