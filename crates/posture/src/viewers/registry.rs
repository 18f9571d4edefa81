//! Viewer sessions and their stream workers.
//!
//! Every connected viewer gets a [`ClientSession`] in the registry and one
//! stream worker thread that drains the latest-wins slot and forwards each
//! fresh result to that viewer only. Disconnecting flips the session's
//! liveness flag; the worker notices on its next poll, exits and removes the
//! session from the registry.

use std::{
    collections::HashMap,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, panic_message},
    pipeline::{
        data::{CameraStateCell, CameraStatus, FrameResult, ViewerEvent},
        slot::{LatestSlot, SlotReader},
        telemetry,
    },
};

/// Opaque identifier, unique for the lifetime of the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Push channel to one viewer. Implementations must not block.
pub trait ViewerSink: Send + Sync {
    fn send(&self, event: &ViewerEvent) -> Result<(), DeliveryError>;
}

pub struct ClientSession {
    id: SessionId,
    live: AtomicBool,
    sink: Box<dyn ViewerSink>,
    connected_at: Instant,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl ClientSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Events handed to the sink successfully.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Events the sink rejected.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Send one event, counting the outcome. Failures, panics included, stay
    /// local to this session.
    pub fn deliver(&self, event: &ViewerEvent) -> Result<(), DeliveryError> {
        let sent = panic::catch_unwind(AssertUnwindSafe(|| self.sink.send(event)))
            .unwrap_or_else(|payload| Err(DeliveryError::Panicked(panic_message(payload.as_ref()))));
        match sent {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("posture_delivery_faults_total", "event" => event.name())
                    .increment(1);
                Err(err)
            }
        }
    }

    fn mark_disconnected(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .field("delivered", &self.delivered())
            .field("failed", &self.failed())
            .finish()
    }
}

struct RegistryInner {
    sessions: RwLock<HashMap<SessionId, Arc<ClientSession>>>,
    workers: Mutex<HashMap<SessionId, thread::JoinHandle<()>>>,
    next_id: AtomicU64,
    frames: LatestSlot<FrameResult>,
    camera_state: Arc<CameraStateCell>,
    poll_timeout: Duration,
}

/// Shared handle to the set of connected viewers.
#[derive(Clone)]
pub struct ClientSessionRegistry {
    inner: Arc<RegistryInner>,
}

impl ClientSessionRegistry {
    pub fn new(
        frames: LatestSlot<FrameResult>,
        camera_state: Arc<CameraStateCell>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                frames,
                camera_state,
                poll_timeout,
            }),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        self.inner.poll_timeout
    }

    /// Slot the stream workers drain.
    pub fn frames(&self) -> &LatestSlot<FrameResult> {
        &self.inner.frames
    }

    /// Camera state sent to newly connected sessions.
    pub fn camera_state(&self) -> &Arc<CameraStateCell> {
        &self.inner.camera_state
    }

    /// Register a viewer and start its stream worker.
    ///
    /// The session is in the registry, and has received the current camera
    /// state, before its worker starts.
    pub fn connect(&self, sink: Box<dyn ViewerSink>) -> io::Result<SessionId> {
        self.reap_finished_workers();

        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(ClientSession {
            id,
            live: AtomicBool::new(true),
            sink,
            connected_at: Instant::now(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let count = {
            let mut sessions = self.inner.sessions.write();
            sessions.insert(id, session.clone());
            // Sent under the write lock so a concurrent status broadcast
            // cannot overtake it.
            let status = CameraStatus::now(self.inner.camera_state.get());
            if let Err(err) = session.deliver(&ViewerEvent::CameraStatus(status)) {
                warn!(session = %id, "initial camera status not delivered: {err}");
            }
            sessions.len()
        };
        metrics::gauge!("posture_viewer_sessions").set(count as f64);

        let worker = StreamWorker {
            registry: self.clone(),
            session: Arc::downgrade(&session),
            id,
            reader: self.inner.frames.reader(),
            poll_timeout: self.inner.poll_timeout,
        };
        match telemetry::spawn_thread(format!("posture-{id}"), move || worker.run()) {
            Ok(handle) => {
                self.inner.workers.lock().insert(id, handle);
                info!(session = %id, viewers = count, "viewer connected");
                Ok(id)
            }
            Err(err) => {
                self.deregister(id);
                Err(err)
            }
        }
    }

    /// Ask the session's worker to stop. Returns `false` for unknown or
    /// already disconnected sessions.
    pub fn disconnect(&self, id: SessionId) -> bool {
        let session = self.inner.sessions.read().get(&id).cloned();
        match session {
            Some(session) => {
                let was_live = session.mark_disconnected();
                if was_live {
                    debug!(session = %id, "viewer disconnect requested");
                }
                was_live
            }
            None => false,
        }
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.sessions.read().contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.inner.sessions.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions registered right now, copied out under the read lock.
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        let mut sessions: Vec<_> = self.inner.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|session| session.id());
        sessions
    }

    /// Stream workers whose threads have not exited yet.
    pub fn running_workers(&self) -> usize {
        self.inner
            .workers
            .lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Disconnect everyone and wait up to `timeout` for the workers. Returns
    /// how many workers were still running at the deadline.
    pub fn shutdown(&self, timeout: Duration) -> usize {
        for session in self.snapshot() {
            session.mark_disconnected();
        }

        let deadline = Instant::now() + timeout;
        let handles: Vec<_> = self.inner.workers.lock().drain().collect();
        let mut stragglers = 0;
        for (id, handle) in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!(session = %id, "stream worker panicked");
                }
            } else {
                warn!(session = %id, "stream worker did not stop in time");
                stragglers += 1;
            }
        }
        stragglers
    }

    fn deregister(&self, id: SessionId) {
        let count = {
            let mut sessions = self.inner.sessions.write();
            sessions.remove(&id);
            sessions.len()
        };
        metrics::gauge!("posture_viewer_sessions").set(count as f64);
        info!(session = %id, viewers = count, "viewer removed");
    }

    fn reap_finished_workers(&self) {
        let finished: Vec<_> = {
            let mut workers = self.inner.workers.lock();
            let ids: Vec<_> = workers
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| workers.remove(&id).map(|handle| (id, handle)))
                .collect()
        };
        for (id, handle) in finished {
            if handle.join().is_err() {
                warn!(session = %id, "stream worker panicked");
            }
        }
    }
}

/// Per-session drain loop.
struct StreamWorker {
    registry: ClientSessionRegistry,
    session: Weak<ClientSession>,
    id: SessionId,
    reader: SlotReader<FrameResult>,
    poll_timeout: Duration,
}

impl StreamWorker {
    fn run(mut self) {
        let span = tracing::info_span!("viewer.session", session = %self.id);
        let _guard = span.enter();

        loop {
            match self.session.upgrade() {
                Some(session) if session.is_live() => {}
                _ => break,
            }
            if self.registry.inner.frames.is_closed() {
                break;
            }

            let Some(frame) = self.reader.try_take(self.poll_timeout) else {
                continue;
            };
            let Some(session) = self.session.upgrade() else {
                break;
            };
            if !session.is_live() {
                break;
            }
            if let Err(err) = session.deliver(&ViewerEvent::PostureUpdate(frame)) {
                debug!(session = %self.id, "posture update not delivered: {err}");
            }
        }

        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        pipeline::data::{CameraState, PostureState},
        testing::RecordingViewer,
    };

    fn registry(poll: Duration) -> (ClientSessionRegistry, LatestSlot<FrameResult>) {
        let slot = LatestSlot::new();
        let registry = ClientSessionRegistry::new(
            slot.clone(),
            Arc::new(CameraStateCell::new(CameraState::Connected)),
            poll,
        );
        (registry, slot)
    }

    fn result(sequence: u64) -> FrameResult {
        FrameResult {
            sequence,
            captured_at: chrono::Utc::now(),
            posture: PostureState::Good,
            presence: true,
            confidence: 0.9,
            encoded_image: None,
            camera_state: CameraState::Connected,
            frame_size: (1, 1),
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn connect_registers_and_sends_current_state_first() {
        let (registry, _slot) = registry(Duration::from_millis(20));
        let viewer = RecordingViewer::new();
        let id = registry.connect(Box::new(viewer.clone())).expect("connect");

        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);
        assert_eq!(viewer.camera_states(), vec![CameraState::Connected]);
        registry.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn worker_forwards_fresh_results() {
        let (registry, slot) = registry(Duration::from_millis(20));
        let viewer = RecordingViewer::new();
        registry.connect(Box::new(viewer.clone())).expect("connect");

        slot.put(result(1));
        assert!(wait_until(Duration::from_secs(2), || viewer
            .posture_sequences()
            .contains(&1)));
        slot.put(result(2));
        assert!(wait_until(Duration::from_secs(2), || viewer
            .posture_sequences()
            .contains(&2)));
        assert_eq!(viewer.posture_sequences(), vec![1, 2]);
        registry.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn disconnect_stops_worker_within_poll_timeout() {
        let poll = Duration::from_millis(50);
        let (registry, _slot) = registry(poll);
        let id = registry
            .connect(Box::new(RecordingViewer::new()))
            .expect("connect");

        assert!(registry.disconnect(id));
        assert!(!registry.disconnect(id), "second disconnect is a no-op");
        assert!(wait_until(poll * 4 + Duration::from_millis(500), || {
            !registry.contains(id)
        }));
        assert!(wait_until(Duration::from_millis(500), || registry
            .running_workers()
            == 0));
    }

    #[test]
    fn failing_viewer_does_not_affect_others() {
        let (registry, slot) = registry(Duration::from_millis(20));
        let broken = RecordingViewer::failing();
        let healthy = RecordingViewer::new();
        let broken_id = registry.connect(Box::new(broken.clone())).expect("connect");
        registry.connect(Box::new(healthy.clone())).expect("connect");

        slot.put(result(5));
        assert!(wait_until(Duration::from_secs(2), || healthy
            .posture_sequences()
            .contains(&5)));
        assert!(wait_until(Duration::from_secs(2), || {
            registry.get(broken_id).is_some_and(|s| s.failed() >= 2)
        }));
        assert!(registry.contains(broken_id));
        registry.shutdown(Duration::from_secs(2));
    }

    struct PanickingViewer;

    impl ViewerSink for PanickingViewer {
        fn send(&self, _event: &ViewerEvent) -> Result<(), DeliveryError> {
            panic!("viewer sink blew up");
        }
    }

    #[test]
    fn panicking_sink_is_a_delivery_fault() {
        let (registry, slot) = registry(Duration::from_millis(20));
        let healthy = RecordingViewer::new();
        let broken_id = registry.connect(Box::new(PanickingViewer)).expect("connect");
        registry.connect(Box::new(healthy.clone())).expect("connect");

        let broken = registry.get(broken_id).expect("session");
        assert_eq!(broken.failed(), 1);
        assert!(matches!(
            broken.deliver(&ViewerEvent::CameraStatus(CameraStatus::now(
                CameraState::Degraded
            ))),
            Err(DeliveryError::Panicked(message)) if message == "viewer sink blew up"
        ));

        slot.put(result(8));
        assert!(wait_until(Duration::from_secs(2), || healthy
            .posture_sequences()
            .contains(&8)));
        assert!(wait_until(Duration::from_secs(2), || broken.failed() >= 3));
        assert!(registry.contains(broken_id));
        registry.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn shutdown_joins_all_workers() {
        let (registry, _slot) = registry(Duration::from_millis(20));
        for _ in 0..3 {
            registry
                .connect(Box::new(RecordingViewer::new()))
                .expect("connect");
        }
        assert_eq!(registry.shutdown(Duration::from_secs(2)), 0);
        assert!(wait_until(Duration::from_secs(1), || registry.is_empty()));
    }

    #[test]
    fn closed_slot_ends_workers() {
        let (registry, slot) = registry(Duration::from_millis(20));
        let id = registry
            .connect(Box::new(RecordingViewer::new()))
            .expect("connect");
        slot.close();
        assert!(wait_until(Duration::from_secs(2), || !registry.contains(id)));
    }
}
