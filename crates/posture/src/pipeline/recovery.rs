//! Camera fault state machine.
//!
//! The controller decides, it never touches the device and never sleeps. The
//! supervisor asks it which kind of acquisition to perform next, reports the
//! outcome, and waits for as long as the controller says.
//!
//! ```text
//! CONNECTED    --read fails-------------------> DEGRADED (quick tier)
//! DEGRADED     --reopen ok--------------------> CONNECTED
//! DEGRADED     --quick_attempts failures------> DISCONNECTED (long tier)
//! DISCONNECTED --reopen fails-----------------> DISCONNECTED, wait long_delay
//! DISCONNECTED --reopen ok--------------------> CONNECTED
//! CONNECTED    --processing fault-------------> DEGRADED (no reopen)
//! DEGRADED     --frame acquired and assessed--> CONNECTED
//! ```
//!
//! A processing degrade holds until an iteration both acquires and assesses
//! a frame, so an assessor that fails on every frame does not flap the state.

use std::time::Duration;

use crate::pipeline::data::CameraState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryTier {
    /// A few closely spaced reopen attempts to absorb transient glitches.
    Quick,
    /// Indefinite reopen attempts at a fixed, longer interval.
    Long,
}

impl RecoveryTier {
    pub fn label(self) -> &'static str {
        match self {
            RecoveryTier::Quick => "quick",
            RecoveryTier::Long => "long",
        }
    }
}

/// Retry cadence for both tiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Consecutive acquisition failures, including the one that opened the
    /// episode, tolerated before escalating to the long tier.
    pub quick_attempts: u32,
    pub quick_delay: Duration,
    pub long_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            quick_attempts: 3,
            quick_delay: Duration::from_secs(1),
            long_delay: Duration::from_secs(10),
        }
    }
}

/// Live recovery attempt; discarded once the camera is back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryEpisode {
    pub tier: RecoveryTier,
    /// Failures counted in the current tier.
    pub failures: u32,
}

/// What the next acquisition step should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Read from the already-open device.
    Read,
    /// Close, reopen and read.
    Reopen(RecoveryTier),
}

/// Decision returned after an acquisition failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryStep {
    /// New camera state to publish, if it changed.
    pub transition: Option<CameraState>,
    /// How long to wait before the next attempt.
    pub wait: Duration,
}

#[derive(Debug)]
pub struct CameraRecoveryController {
    policy: RecoveryPolicy,
    state: CameraState,
    episode: Option<RecoveryEpisode>,
    /// Set by a processing fault, cleared by the next assessed frame.
    processing_degraded: bool,
}

impl CameraRecoveryController {
    /// Starts DISCONNECTED in the long tier: the device has never been opened.
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy: RecoveryPolicy {
                quick_attempts: policy.quick_attempts.max(1),
                ..policy
            },
            state: CameraState::Disconnected,
            episode: Some(RecoveryEpisode {
                tier: RecoveryTier::Long,
                failures: 0,
            }),
            processing_degraded: false,
        }
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn episode(&self) -> Option<RecoveryEpisode> {
        self.episode
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn next_acquisition(&self) -> AcquisitionMode {
        match self.episode {
            Some(episode) => AcquisitionMode::Reopen(episode.tier),
            None => AcquisitionMode::Read,
        }
    }

    pub fn on_acquisition_failure(&mut self) -> RecoveryStep {
        match self.episode {
            None => {
                let transition = self.enter(CameraState::Degraded);
                self.episode = Some(RecoveryEpisode {
                    tier: RecoveryTier::Quick,
                    failures: 1,
                });
                if self.policy.quick_attempts <= 1 {
                    return self.escalate();
                }
                RecoveryStep {
                    transition,
                    wait: self.policy.quick_delay,
                }
            }
            Some(RecoveryEpisode {
                tier: RecoveryTier::Quick,
                failures,
            }) => {
                let failures = failures.saturating_add(1);
                if failures >= self.policy.quick_attempts {
                    return self.escalate();
                }
                self.episode = Some(RecoveryEpisode {
                    tier: RecoveryTier::Quick,
                    failures,
                });
                RecoveryStep {
                    transition: None,
                    wait: self.policy.quick_delay,
                }
            }
            Some(RecoveryEpisode {
                tier: RecoveryTier::Long,
                failures,
            }) => {
                self.episode = Some(RecoveryEpisode {
                    tier: RecoveryTier::Long,
                    failures: failures.saturating_add(1),
                });
                RecoveryStep {
                    transition: self.enter(CameraState::Disconnected),
                    wait: self.policy.long_delay,
                }
            }
        }
    }

    /// A frame came back. Ends any episode; the camera counts as connected
    /// unless the assessor is still failing.
    pub fn on_acquisition_success(&mut self) -> Option<CameraState> {
        self.episode = None;
        if self.processing_degraded {
            self.enter(CameraState::Degraded)
        } else {
            self.enter(CameraState::Connected)
        }
    }

    /// The assessor failed on a good frame. Degrades a connected camera but
    /// leaves device I/O alone: the next acquisition is still a plain read.
    pub fn on_processing_fault(&mut self) -> Option<CameraState> {
        if self.state == CameraState::Connected {
            self.processing_degraded = true;
            self.enter(CameraState::Degraded)
        } else {
            None
        }
    }

    /// The assessor handled a frame. Lifts a processing degrade.
    pub fn on_processing_success(&mut self) -> Option<CameraState> {
        if std::mem::take(&mut self.processing_degraded) {
            self.enter(CameraState::Connected)
        } else {
            None
        }
    }

    fn escalate(&mut self) -> RecoveryStep {
        self.episode = Some(RecoveryEpisode {
            tier: RecoveryTier::Long,
            failures: 0,
        });
        RecoveryStep {
            transition: self.enter(CameraState::Disconnected),
            wait: self.policy.long_delay,
        }
    }

    fn enter(&mut self, state: CameraState) -> Option<CameraState> {
        if self.state == state {
            None
        } else {
            self.state = state;
            Some(state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy {
            quick_attempts: 3,
            quick_delay: Duration::from_secs(1),
            long_delay: Duration::from_secs(10),
        }
    }

    fn connected() -> CameraRecoveryController {
        let mut controller = CameraRecoveryController::new(policy());
        assert_eq!(
            controller.on_acquisition_success(),
            Some(CameraState::Connected)
        );
        controller
    }

    #[test]
    fn starts_disconnected_and_reopens() {
        let controller = CameraRecoveryController::new(policy());
        assert_eq!(controller.state(), CameraState::Disconnected);
        assert_eq!(
            controller.next_acquisition(),
            AcquisitionMode::Reopen(RecoveryTier::Long)
        );
    }

    #[test]
    fn failed_first_open_stays_disconnected_silently() {
        let mut controller = CameraRecoveryController::new(policy());
        let step = controller.on_acquisition_failure();
        assert_eq!(step.transition, None);
        assert_eq!(step.wait, Duration::from_secs(10));
    }

    #[test]
    fn single_failure_recovers_in_quick_tier() {
        let mut controller = connected();
        assert_eq!(controller.next_acquisition(), AcquisitionMode::Read);

        let step = controller.on_acquisition_failure();
        assert_eq!(step.transition, Some(CameraState::Degraded));
        assert_eq!(step.wait, Duration::from_secs(1));
        assert_eq!(
            controller.next_acquisition(),
            AcquisitionMode::Reopen(RecoveryTier::Quick)
        );

        assert_eq!(
            controller.on_acquisition_success(),
            Some(CameraState::Connected)
        );
        assert_eq!(controller.episode(), None);
        assert_eq!(controller.next_acquisition(), AcquisitionMode::Read);
    }

    #[test]
    fn exhausted_quick_tier_escalates_to_long_tier() {
        let mut controller = connected();
        let mut transitions = Vec::new();
        let mut waits = Vec::new();
        for _ in 0..3 {
            let step = controller.on_acquisition_failure();
            transitions.extend(step.transition);
            waits.push(step.wait);
        }
        assert_eq!(
            transitions,
            vec![CameraState::Degraded, CameraState::Disconnected]
        );
        assert_eq!(
            waits,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(10)
            ]
        );
        assert_eq!(
            controller.next_acquisition(),
            AcquisitionMode::Reopen(RecoveryTier::Long)
        );

        for _ in 0..5 {
            let step = controller.on_acquisition_failure();
            assert_eq!(step.transition, None);
            assert_eq!(step.wait, Duration::from_secs(10));
        }
        assert_eq!(
            controller.episode(),
            Some(RecoveryEpisode {
                tier: RecoveryTier::Long,
                failures: 5
            })
        );

        assert_eq!(
            controller.on_acquisition_success(),
            Some(CameraState::Connected)
        );
    }

    #[test]
    fn scripted_ok_fail_fail_fail_ok() {
        let mut controller = CameraRecoveryController::new(policy());
        let mut states = Vec::new();
        for ok in [true, false, false, false, true] {
            if ok {
                controller.on_acquisition_success();
            } else {
                controller.on_acquisition_failure();
            }
            states.push(controller.state());
        }
        assert_eq!(
            states,
            vec![
                CameraState::Connected,
                CameraState::Degraded,
                CameraState::Degraded,
                CameraState::Disconnected,
                CameraState::Connected,
            ]
        );
    }

    #[test]
    fn processing_fault_degrades_without_reopen() {
        let mut controller = connected();
        assert_eq!(
            controller.on_processing_fault(),
            Some(CameraState::Degraded)
        );
        assert_eq!(controller.next_acquisition(), AcquisitionMode::Read);
        assert_eq!(controller.on_processing_fault(), None);
        assert_eq!(controller.on_acquisition_success(), None);
        assert_eq!(
            controller.on_processing_success(),
            Some(CameraState::Connected)
        );
        assert_eq!(controller.on_processing_success(), None);
    }

    #[test]
    fn persistent_processing_faults_do_not_flap() {
        let mut controller = connected();
        assert_eq!(
            controller.on_processing_fault(),
            Some(CameraState::Degraded)
        );
        for _ in 0..5 {
            assert_eq!(controller.on_acquisition_success(), None);
            assert_eq!(controller.on_processing_fault(), None);
        }
        assert_eq!(controller.state(), CameraState::Degraded);
    }

    #[test]
    fn reopen_while_processing_degraded_reports_degraded() {
        let mut controller = connected();
        controller.on_processing_fault();
        for _ in 0..3 {
            controller.on_acquisition_failure();
        }
        assert_eq!(controller.state(), CameraState::Disconnected);
        assert_eq!(
            controller.on_acquisition_success(),
            Some(CameraState::Degraded)
        );
        assert_eq!(
            controller.on_processing_success(),
            Some(CameraState::Connected)
        );
    }

    #[test]
    fn acquisition_failure_after_processing_fault_starts_quick_tier() {
        let mut controller = connected();
        controller.on_processing_fault();
        let step = controller.on_acquisition_failure();
        assert_eq!(step.transition, None);
        assert_eq!(
            controller.next_acquisition(),
            AcquisitionMode::Reopen(RecoveryTier::Quick)
        );
    }

    #[test]
    fn single_quick_attempt_escalates_immediately() {
        let mut controller = CameraRecoveryController::new(RecoveryPolicy {
            quick_attempts: 1,
            ..policy()
        });
        controller.on_acquisition_success();
        let step = controller.on_acquisition_failure();
        assert_eq!(step.transition, Some(CameraState::Disconnected));
        assert_eq!(step.wait, Duration::from_secs(10));
    }
}
