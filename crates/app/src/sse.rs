//! Server-Sent Events plumbing between viewer sessions and HTTP responses.

use actix_web::web::Bytes;
use posture::{ClientSessionRegistry, DeliveryError, SessionId, ViewerEvent, ViewerSink};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Pending events held per viewer before sends start failing.
pub const SESSION_BUFFER: usize = 8;

/// Sent before the first event so browsers reconnect after one second.
pub const RETRY_PREAMBLE: &[u8] = b"retry: 1000\n\n";

pub const KEEP_ALIVE: &[u8] = b": keep-alive\n\n";

/// Format one event as an SSE chunk.
pub fn sse_chunk(event: &ViewerEvent) -> Result<Bytes, DeliveryError> {
    let json = event.payload_json()?;
    let mut chunk = String::with_capacity(json.len() + 48);
    chunk.push_str("event: ");
    chunk.push_str(event.name());
    chunk.push('\n');
    if let ViewerEvent::PostureUpdate(result) = event {
        chunk.push_str("id: ");
        chunk.push_str(&result.sequence.to_string());
        chunk.push('\n');
    }
    chunk.push_str("data: ");
    chunk.push_str(&json);
    chunk.push_str("\n\n");
    Ok(Bytes::from(chunk))
}

/// Viewer sink backed by a bounded channel drained by the HTTP response.
pub struct SseSink {
    tx: mpsc::Sender<Bytes>,
}

impl SseSink {
    pub fn channel() -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        (Self { tx }, rx)
    }
}

impl ViewerSink for SseSink {
    fn send(&self, event: &ViewerEvent) -> Result<(), DeliveryError> {
        let chunk = sse_chunk(event)?;
        self.tx.try_send(chunk).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Backpressure,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Disconnects the session when the response stream is dropped.
pub struct SessionGuard {
    registry: ClientSessionRegistry,
    id: SessionId,
}

impl SessionGuard {
    pub fn new(registry: ClientSessionRegistry, id: SessionId) -> Self {
        Self { registry, id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.registry.disconnect(self.id) {
            debug!(session = %self.id, "event stream closed by client");
        }
    }
}
