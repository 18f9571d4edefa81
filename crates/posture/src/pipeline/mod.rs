//! Producer side of the posture pipeline.
//!
//! - `supervisor`: the capture → assess → publish loop.
//! - `recovery`: three-tier camera fault state machine.
//! - `heartbeat`: liveness notifications for the process supervisor.
//! - `slot`: latest-wins hand-off to viewers.
//! - `processor`: assessor collaborators.
//! - `encoding`: JPEG encoding of captured frames.
//! - `config`: CLI configuration parsing.
//! - `telemetry`: tracing subscribers and Prometheus metrics.
//! - `clock`: time source, swappable in tests.
//! - `data`: values shared between producer and viewers.

pub mod clock;
pub mod config;
pub mod data;
pub mod encoding;
pub mod heartbeat;
pub mod processor;
pub mod recovery;
pub mod slot;
pub mod supervisor;
pub mod telemetry;
