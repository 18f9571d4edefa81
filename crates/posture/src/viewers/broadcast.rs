use tracing::{debug, warn};

use crate::{
    pipeline::data::{CameraStatus, ViewerEvent},
    viewers::registry::ClientSessionRegistry,
};

/// Outcome of one status broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Pushes camera state transitions to every registered session.
#[derive(Clone)]
pub struct StatusBroadcaster {
    registry: ClientSessionRegistry,
}

impl StatusBroadcaster {
    pub fn new(registry: ClientSessionRegistry) -> Self {
        Self { registry }
    }

    /// Send `status` to each session in a registry snapshot. A failed or
    /// panicking send is logged and skipped; the session stays registered.
    pub fn broadcast(&self, status: CameraStatus) -> BroadcastReport {
        let event = ViewerEvent::CameraStatus(status);
        let mut report = BroadcastReport::default();
        for session in self.registry.snapshot() {
            match session.deliver(&event) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(session = %session.id(), state = %status.state, "camera status not delivered: {err}");
                }
            }
        }
        debug!(
            state = %status.state,
            delivered = report.delivered,
            failed = report.failed,
            "camera status broadcast"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        pipeline::{
            data::{CameraState, CameraStateCell},
            slot::LatestSlot,
        },
        testing::RecordingViewer,
    };

    #[test]
    fn failure_to_one_session_is_isolated() {
        let registry = ClientSessionRegistry::new(
            LatestSlot::new(),
            Arc::new(CameraStateCell::new(CameraState::Connected)),
            Duration::from_millis(20),
        );
        let broken = RecordingViewer::failing();
        let healthy = RecordingViewer::new();
        let broken_id = registry.connect(Box::new(broken.clone())).expect("connect");
        let healthy_id = registry.connect(Box::new(healthy.clone())).expect("connect");

        let report = StatusBroadcaster::new(registry.clone())
            .broadcast(CameraStatus::now(CameraState::Disconnected));

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(
            healthy.camera_states(),
            vec![CameraState::Connected, CameraState::Disconnected]
        );
        assert!(registry.contains(broken_id));
        assert!(registry.contains(healthy_id));
        registry.shutdown(Duration::from_secs(2));
    }

    struct PanicOnConnected;

    impl crate::viewers::registry::ViewerSink for PanicOnConnected {
        fn send(&self, event: &ViewerEvent) -> Result<(), crate::error::DeliveryError> {
            match event {
                ViewerEvent::CameraStatus(status) if status.state == CameraState::Connected => {
                    panic!("cannot render CONNECTED")
                }
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn panicking_session_does_not_stop_the_broadcast() {
        let registry = ClientSessionRegistry::new(
            LatestSlot::new(),
            Arc::new(CameraStateCell::new(CameraState::Degraded)),
            Duration::from_millis(20),
        );
        let panicking_id = registry.connect(Box::new(PanicOnConnected)).expect("connect");
        let healthy = RecordingViewer::new();
        registry.connect(Box::new(healthy.clone())).expect("connect");

        let report = StatusBroadcaster::new(registry.clone())
            .broadcast(CameraStatus::now(CameraState::Connected));

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(
            healthy.camera_states(),
            vec![CameraState::Degraded, CameraState::Connected]
        );
        assert!(registry.contains(panicking_id));
        registry.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn empty_registry_is_a_no_op() {
        let registry = ClientSessionRegistry::new(
            LatestSlot::new(),
            Arc::new(CameraStateCell::default()),
            Duration::from_millis(20),
        );
        let report =
            StatusBroadcaster::new(registry).broadcast(CameraStatus::now(CameraState::Degraded));
        assert_eq!(report, BroadcastReport::default());
    }
}
