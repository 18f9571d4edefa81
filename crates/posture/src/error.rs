//! Fault taxonomy.
//!
//! Acquisition and processing faults are recovered inside the producer loop;
//! delivery faults are isolated to one viewer session. None of them escape
//! to the caller.

use std::{any::Any, time::Duration};

use thiserror::Error;
use video_ingest::CaptureError;

/// A fault observed by the producer during one iteration.
#[derive(Debug, Error)]
pub enum PipelineFault {
    /// The device handed back no frame; drives camera recovery.
    #[error("acquisition fault: {0}")]
    Acquisition(#[from] CaptureError),
    /// The assessor failed; degrades state without touching camera I/O.
    #[error("processing fault: {0}")]
    Processing(#[from] ProcessingError),
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("assessor failed: {0}")]
    Failed(#[from] anyhow::Error),
    #[error("assessor panicked: {0}")]
    Panicked(String),
    #[error("assessor I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed assessor response: {0}")]
    Protocol(String),
    #[error("assessor gave no reply within {waited:?}")]
    Timeout { waited: Duration },
}

/// Failure to push an event to one viewer.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("viewer buffer full; event dropped")]
    Backpressure,
    #[error("viewer connection closed")]
    Closed,
    #[error("viewer sink panicked: {0}")]
    Panicked(String),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("supervisor notification failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid notify socket address {0:?}")]
    InvalidAddress(String),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    Geometry { expected: usize, actual: usize },
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
