//! Liveness signal for the external process supervisor.
//!
//! The emitter is called inline from the producer loop before every wait, so
//! a loop that stops iterating stops beating and the supervisor restarts the
//! process. Sending is best-effort: failures are logged and swallowed.

use std::{
    os::unix::net::UnixDatagram,
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::error::HeartbeatError;

/// Environment variable naming the supervisor's notification socket.
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";
/// Environment variable carrying the supervisor's watchdog timeout (µs).
pub const WATCHDOG_USEC_ENV: &str = "WATCHDOG_USEC";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyMessage {
    /// Start-up finished.
    Ready,
    /// Still alive.
    Watchdog,
    /// Shutdown began.
    Stopping,
    /// Free-form status line.
    Status(String),
}

impl NotifyMessage {
    /// `sd_notify` wire form.
    pub fn wire(&self) -> String {
        match self {
            NotifyMessage::Ready => "READY=1".to_string(),
            NotifyMessage::Watchdog => "WATCHDOG=1".to_string(),
            NotifyMessage::Stopping => "STOPPING=1".to_string(),
            NotifyMessage::Status(status) => format!("STATUS={}", status.replace('\n', " ")),
        }
    }
}

/// Destination for supervisor notifications.
pub trait HeartbeatSink: Send {
    /// Must not block.
    fn notify(&mut self, message: &NotifyMessage) -> Result<(), HeartbeatError>;
}

/// Datagram notifier speaking the systemd `sd_notify` protocol.
pub struct SystemdNotifier {
    socket: UnixDatagram,
    address: String,
}

impl SystemdNotifier {
    /// Connect to `$NOTIFY_SOCKET` if the process runs under a notify-aware
    /// supervisor.
    pub fn from_env() -> Option<Result<Self, HeartbeatError>> {
        let address = std::env::var(NOTIFY_SOCKET_ENV).ok()?;
        if address.is_empty() {
            return None;
        }
        Some(Self::connect(&address))
    }

    /// Connect to a filesystem socket path or a Linux abstract address
    /// written with a leading `@`.
    pub fn connect(address: &str) -> Result<Self, HeartbeatError> {
        let socket = UnixDatagram::unbound()?;
        socket.set_nonblocking(true)?;
        match address.strip_prefix('@') {
            Some(name) => connect_abstract(&socket, name)?,
            None if address.starts_with('/') => socket.connect(address)?,
            None => return Err(HeartbeatError::InvalidAddress(address.to_string())),
        }
        Ok(Self {
            socket,
            address: address.to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(socket: &UnixDatagram, name: &str) -> Result<(), HeartbeatError> {
    use std::os::{linux::net::SocketAddrExt, unix::net::SocketAddr};

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    socket.connect_addr(&addr)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_socket: &UnixDatagram, name: &str) -> Result<(), HeartbeatError> {
    Err(HeartbeatError::InvalidAddress(format!("@{name}")))
}

impl HeartbeatSink for SystemdNotifier {
    fn notify(&mut self, message: &NotifyMessage) -> Result<(), HeartbeatError> {
        self.socket.send(message.wire().as_bytes())?;
        Ok(())
    }
}

/// Fallback sink when no supervisor socket is configured.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl HeartbeatSink for LoggingNotifier {
    fn notify(&mut self, message: &NotifyMessage) -> Result<(), HeartbeatError> {
        trace!(message = %message.wire(), "supervisor notification (no notify socket)");
        Ok(())
    }
}

/// Pick the supervisor socket from the environment, falling back to logging.
pub fn sink_from_env() -> Box<dyn HeartbeatSink> {
    match SystemdNotifier::from_env() {
        Some(Ok(notifier)) => {
            debug!(address = notifier.address(), "supervisor notify socket connected");
            Box::new(notifier)
        }
        Some(Err(err)) => {
            warn!("failed to connect supervisor notify socket: {err}; heartbeats disabled");
            Box::new(LoggingNotifier)
        }
        None => Box::new(LoggingNotifier),
    }
}

/// Parse a `WATCHDOG_USEC` value.
pub fn parse_watchdog_usec(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|usec| *usec > 0)
        .map(Duration::from_micros)
}

/// Rate-limited liveness notifications.
pub struct HeartbeatEmitter {
    sink: Box<dyn HeartbeatSink>,
    interval: Duration,
    last_beat: Option<Instant>,
    beats: u64,
}

impl HeartbeatEmitter {
    pub fn new(sink: Box<dyn HeartbeatSink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            last_beat: None,
            beats: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Heartbeats attempted so far.
    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// Beat if at least one interval elapsed since the previous beat (or if
    /// none was sent yet). Returns whether a beat was attempted.
    pub fn maybe_beat(&mut self, now: Instant) -> bool {
        let due = match self.last_beat {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        };
        if !due {
            return false;
        }

        self.last_beat = Some(now);
        self.beats = self.beats.wrapping_add(1);
        metrics::counter!("posture_heartbeats_total").increment(1);
        if let Err(err) = self.sink.notify(&NotifyMessage::Watchdog) {
            metrics::counter!("posture_heartbeat_failures_total").increment(1);
            warn!("heartbeat not delivered: {err}");
        }
        true
    }

    /// Best-effort lifecycle message outside the heartbeat cadence.
    pub fn notify(&mut self, message: NotifyMessage) {
        if let Err(err) = self.sink.notify(&message) {
            warn!(message = %message.wire(), "supervisor notification failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{Arc, Mutex},
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<NotifyMessage>>>);

    impl HeartbeatSink for Collect {
        fn notify(&mut self, message: &NotifyMessage) -> Result<(), HeartbeatError> {
            self.0.lock().expect("collect lock").push(message.clone());
            Ok(())
        }
    }

    struct Broken;

    impl HeartbeatSink for Broken {
        fn notify(&mut self, _message: &NotifyMessage) -> Result<(), HeartbeatError> {
            Err(HeartbeatError::Io(std::io::Error::other("supervisor gone")))
        }
    }

    fn unique_socket_path() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!("posture-notify-{}-{nanos}.sock", std::process::id()))
    }

    #[test]
    fn beats_only_after_interval() {
        let sink = Collect::default();
        let mut emitter = HeartbeatEmitter::new(Box::new(sink.clone()), Duration::from_secs(15));
        let start = Instant::now();

        assert!(emitter.maybe_beat(start));
        assert!(!emitter.maybe_beat(start + Duration::from_secs(14)));
        assert!(emitter.maybe_beat(start + Duration::from_secs(15)));
        assert!(!emitter.maybe_beat(start + Duration::from_secs(16)));
        assert_eq!(emitter.beats(), 2);
        assert_eq!(
            *sink.0.lock().expect("collect lock"),
            vec![NotifyMessage::Watchdog, NotifyMessage::Watchdog]
        );
    }

    #[test]
    fn failing_sink_is_swallowed() {
        let mut emitter = HeartbeatEmitter::new(Box::new(Broken), Duration::from_millis(1));
        let start = Instant::now();
        assert!(emitter.maybe_beat(start));
        assert!(emitter.maybe_beat(start + Duration::from_millis(5)));
        emitter.notify(NotifyMessage::Stopping);
        assert_eq!(emitter.beats(), 2);
    }

    #[test]
    fn wire_format() {
        assert_eq!(NotifyMessage::Ready.wire(), "READY=1");
        assert_eq!(NotifyMessage::Watchdog.wire(), "WATCHDOG=1");
        assert_eq!(NotifyMessage::Stopping.wire(), "STOPPING=1");
        assert_eq!(
            NotifyMessage::Status("camera\ndegraded".into()).wire(),
            "STATUS=camera degraded"
        );
    }

    #[test]
    fn parses_watchdog_usec() {
        assert_eq!(parse_watchdog_usec("30000000"), Some(Duration::from_secs(30)));
        assert_eq!(parse_watchdog_usec("0"), None);
        assert_eq!(parse_watchdog_usec("soon"), None);
    }

    #[test]
    fn systemd_notifier_sends_datagrams() {
        let path = unique_socket_path();
        let server = UnixDatagram::bind(&path).expect("bind notify socket");
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout");

        let mut notifier =
            SystemdNotifier::connect(path.to_str().expect("utf-8 path")).expect("connect");
        notifier.notify(&NotifyMessage::Watchdog).expect("send");

        let mut buf = [0u8; 64];
        let len = server.recv(&mut buf).expect("recv");
        assert_eq!(&buf[..len], b"WATCHDOG=1");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn relative_address_is_rejected() {
        assert!(matches!(
            SystemdNotifier::connect("relative.sock"),
            Err(HeartbeatError::InvalidAddress(_))
        ));
    }

    #[test]
    fn missing_socket_fails_to_connect() {
        assert!(SystemdNotifier::connect("/nonexistent/posture-notify.sock").is_err());
    }
}
