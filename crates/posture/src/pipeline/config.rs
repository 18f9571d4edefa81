//! Configuration parsing for the posture pipeline.
//!
//! This module owns translation of CLI arguments (or their `POSTURE_*`
//! environment equivalents) into a validated `PipelineConfig` which the
//! producer and the viewer side use without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;

use crate::pipeline::{
    heartbeat::{WATCHDOG_USEC_ENV, parse_watchdog_usec},
    processor::DEFAULT_PROCESSOR_TIMEOUT,
    recovery::RecoveryPolicy,
};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_SUPERVISOR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq)]
/// Capture device settings.
pub struct CameraConfig {
    /// Device index, `/dev/videoN` path or stream URI.
    pub uri: String,
    pub width: i32,
    pub height: i32,
    /// Frame rate requested from the device.
    pub fps: u32,
    /// Longest a single read may wait for the device.
    pub read_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Liveness contract with the external process supervisor.
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// The supervisor's own restart timeout; only used for validation.
    pub supervisor_timeout: Duration,
}

#[derive(Clone, Debug, Default, PartialEq)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
/// Canonical configuration shared by the producer and the viewer side.
pub struct PipelineConfig {
    pub camera: CameraConfig,
    pub recovery: RecoveryPolicy,
    pub heartbeat: HeartbeatConfig,
    /// Results produced per second when the camera keeps up.
    pub target_fps: u32,
    /// JPEG quality for the encoded image (1-100).
    pub jpeg_quality: u8,
    /// Stream worker poll timeout; bounds viewer shutdown latency.
    pub stream_poll: Duration,
    /// Pause after a processing fault or a failed iteration.
    pub fault_pause: Duration,
    /// How long shutdown waits for the producer and the workers.
    pub shutdown_timeout: Duration,
    /// External assessor command line; `None` reports no subject.
    pub processor_command: Option<String>,
    /// Longest the assessor may take to answer one frame.
    pub processor_timeout: Duration,
    pub telemetry: TelemetryOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                uri: "0".to_string(),
                width: 640,
                height: 480,
                fps: 15,
                read_timeout: Duration::from_secs(2),
            },
            recovery: RecoveryPolicy::default(),
            heartbeat: HeartbeatConfig {
                interval: DEFAULT_HEARTBEAT_INTERVAL,
                supervisor_timeout: DEFAULT_SUPERVISOR_TIMEOUT,
            },
            target_fps: 5,
            jpeg_quality: 80,
            stream_poll: Duration::from_millis(500),
            fault_pause: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            processor_command: None,
            processor_timeout: DEFAULT_PROCESSOR_TIMEOUT,
            telemetry: TelemetryOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Target period between produced results.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }

    /// Check the cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.camera.width <= 0 || self.camera.height <= 0 {
            bail!("Capture width and height must be positive integers");
        }
        if self.camera.fps == 0 {
            bail!("--capture-fps must be at least 1");
        }
        if self.target_fps == 0 {
            bail!("--target-fps must be at least 1");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if self.recovery.quick_attempts == 0 {
            bail!("--quick-attempts must be at least 1");
        }
        if self.heartbeat.interval.is_zero() {
            bail!("--heartbeat-interval must be positive");
        }
        if self.stream_poll.is_zero() {
            bail!("--stream-poll must be positive");
        }
        if self.processor_timeout.is_zero() {
            bail!("--processor-timeout must be positive");
        }
        if self.heartbeat.supervisor_timeout <= self.heartbeat.interval {
            bail!(
                "supervisor timeout ({}) must exceed the heartbeat interval ({})",
                humantime::format_duration(self.heartbeat.supervisor_timeout),
                humantime::format_duration(self.heartbeat.interval)
            );
        }
        if self.heartbeat.supervisor_timeout <= self.recovery.long_delay {
            bail!(
                "supervisor timeout ({}) must exceed the long retry delay ({})",
                humantime::format_duration(self.heartbeat.supervisor_timeout),
                humantime::format_duration(self.recovery.long_delay)
            );
        }
        // Heartbeats are offered between blocking calls, never during one.
        let worst_gap =
            self.heartbeat.interval + self.camera.read_timeout + self.processor_timeout;
        if self.heartbeat.supervisor_timeout <= worst_gap {
            bail!(
                "supervisor timeout ({}) must exceed the heartbeat interval plus the read and processor timeouts ({})",
                humantime::format_duration(self.heartbeat.supervisor_timeout),
                humantime::format_duration(worst_gap)
            );
        }
        Ok(())
    }

    /// Build from CLI arguments plus the supervisor's watchdog timeout, if it
    /// advertised one.
    pub fn from_args(args: PipelineCliArgs, watchdog: Option<Duration>) -> Result<Self> {
        let defaults = Self::default();

        let supervisor_timeout = args
            .supervisor_timeout
            .or(watchdog)
            .unwrap_or(DEFAULT_SUPERVISOR_TIMEOUT);
        let heartbeat_interval = args
            .heartbeat_interval
            .or(watchdog.map(|timeout| timeout / 2))
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);

        let jpeg_quality = args.jpeg_quality.unwrap_or(defaults.jpeg_quality as u32);
        if !(1..=100).contains(&jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let processor_command = args
            .processor_cmd
            .map(|cmd| cmd.trim().to_string())
            .filter(|cmd| !cmd.is_empty());

        let config = Self {
            camera: CameraConfig {
                uri: args.source.unwrap_or(defaults.camera.uri),
                width: args.width.unwrap_or(defaults.camera.width),
                height: args.height.unwrap_or(defaults.camera.height),
                fps: args.capture_fps.unwrap_or(defaults.camera.fps),
                read_timeout: args.read_timeout.unwrap_or(defaults.camera.read_timeout),
            },
            recovery: RecoveryPolicy {
                quick_attempts: args
                    .quick_attempts
                    .unwrap_or(defaults.recovery.quick_attempts),
                quick_delay: args.quick_delay.unwrap_or(defaults.recovery.quick_delay),
                long_delay: args.long_delay.unwrap_or(defaults.recovery.long_delay),
            },
            heartbeat: HeartbeatConfig {
                interval: heartbeat_interval,
                supervisor_timeout,
            },
            target_fps: args.target_fps.unwrap_or(defaults.target_fps),
            jpeg_quality: jpeg_quality as u8,
            stream_poll: args.stream_poll.unwrap_or(defaults.stream_poll),
            fault_pause: args.fault_pause.unwrap_or(defaults.fault_pause),
            shutdown_timeout: args.shutdown_timeout.unwrap_or(defaults.shutdown_timeout),
            processor_command,
            processor_timeout: args
                .processor_timeout
                .unwrap_or(defaults.processor_timeout),
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

/// CLI arguments for the pipeline.
#[derive(Debug, Default, Args)]
pub struct PipelineCliArgs {
    /// Camera device index, `/dev/videoN` path or stream URI [default: 0].
    #[arg(long = "source", value_name = "URI", env = "POSTURE_SOURCE")]
    pub source: Option<String>,
    /// Capture width in pixels [default: 640].
    #[arg(long = "width", value_name = "PX", env = "POSTURE_WIDTH")]
    pub width: Option<i32>,
    /// Capture height in pixels [default: 480].
    #[arg(long = "height", value_name = "PX", env = "POSTURE_HEIGHT")]
    pub height: Option<i32>,
    /// Frame rate requested from the device [default: 15].
    #[arg(long = "capture-fps", value_name = "N", env = "POSTURE_CAPTURE_FPS")]
    pub capture_fps: Option<u32>,
    /// Longest a single device read may block [default: 2s].
    #[arg(long = "read-timeout", value_name = "DURATION", env = "POSTURE_READ_TIMEOUT", value_parser = humantime::parse_duration)]
    pub read_timeout: Option<Duration>,
    /// Posture results produced per second [default: 5].
    #[arg(long = "target-fps", value_name = "N", env = "POSTURE_TARGET_FPS")]
    pub target_fps: Option<u32>,
    /// JPEG quality for viewer images, 1-100 [default: 80].
    #[arg(long = "jpeg-quality", value_name = "QUALITY", env = "POSTURE_JPEG_QUALITY")]
    pub jpeg_quality: Option<u32>,
    /// Failures tolerated before a fault counts as a disconnect [default: 3].
    #[arg(long = "quick-attempts", value_name = "N", env = "POSTURE_QUICK_ATTEMPTS")]
    pub quick_attempts: Option<u32>,
    /// Delay between quick reconnect attempts [default: 1s].
    #[arg(long = "quick-delay", value_name = "DURATION", env = "POSTURE_QUICK_DELAY", value_parser = humantime::parse_duration)]
    pub quick_delay: Option<Duration>,
    /// Delay between reconnect attempts while disconnected [default: 10s].
    #[arg(long = "long-delay", value_name = "DURATION", env = "POSTURE_LONG_DELAY", value_parser = humantime::parse_duration)]
    pub long_delay: Option<Duration>,
    /// Supervisor heartbeat interval [default: 15s, or half of WATCHDOG_USEC].
    #[arg(long = "heartbeat-interval", value_name = "DURATION", env = "POSTURE_HEARTBEAT_INTERVAL", value_parser = humantime::parse_duration)]
    pub heartbeat_interval: Option<Duration>,
    /// Supervisor restart timeout [default: 30s, or WATCHDOG_USEC].
    #[arg(long = "supervisor-timeout", value_name = "DURATION", env = "POSTURE_SUPERVISOR_TIMEOUT", value_parser = humantime::parse_duration)]
    pub supervisor_timeout: Option<Duration>,
    /// Viewer stream poll timeout [default: 500ms].
    #[arg(long = "stream-poll", value_name = "DURATION", env = "POSTURE_STREAM_POLL", value_parser = humantime::parse_duration)]
    pub stream_poll: Option<Duration>,
    /// Pause after a failed assessment [default: 100ms].
    #[arg(long = "fault-pause", value_name = "DURATION", env = "POSTURE_FAULT_PAUSE", value_parser = humantime::parse_duration)]
    pub fault_pause: Option<Duration>,
    /// How long shutdown waits for threads to stop [default: 5s].
    #[arg(long = "shutdown-timeout", value_name = "DURATION", env = "POSTURE_SHUTDOWN_TIMEOUT", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Option<Duration>,
    /// External assessor command line (frames on stdin, JSON on stdout).
    #[arg(long = "processor-cmd", value_name = "COMMAND", env = "POSTURE_PROCESSOR_CMD")]
    pub processor_cmd: Option<String>,
    /// Longest the assessor may take to answer one frame [default: 2s].
    #[arg(long = "processor-timeout", value_name = "DURATION", env = "POSTURE_PROCESSOR_TIMEOUT", value_parser = humantime::parse_duration)]
    pub processor_timeout: Option<Duration>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH", env = "POSTURE_CHROME_TRACE")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<PipelineCliArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: PipelineCliArgs) -> Result<Self> {
        let watchdog = std::env::var(WATCHDOG_USEC_ENV)
            .ok()
            .and_then(|raw| parse_watchdog_usec(&raw));
        Self::from_args(args, watchdog)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        pipeline: PipelineCliArgs,
    }

    fn parse(args: &[&str]) -> PipelineCliArgs {
        let mut argv = vec!["posture"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("valid args").pipeline
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::from_args(PipelineCliArgs::default(), None).expect("config");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.recovery.quick_attempts, 3);
        assert_eq!(config.recovery.quick_delay, Duration::from_secs(1));
        assert_eq!(config.recovery.long_delay, Duration::from_secs(10));
        assert_eq!(config.heartbeat.interval, Duration::from_secs(15));
        assert_eq!(config.frame_period(), Duration::from_millis(200));
    }

    #[test]
    fn parses_human_durations() {
        let args = parse(&[
            "--source",
            "/dev/video2",
            "--quick-delay",
            "250ms",
            "--long-delay",
            "5s",
            "--processor-cmd",
            "python3 assess.py",
        ]);
        let config = PipelineConfig::from_args(args, None).expect("config");
        assert_eq!(config.camera.uri, "/dev/video2");
        assert_eq!(config.recovery.quick_delay, Duration::from_millis(250));
        assert_eq!(config.recovery.long_delay, Duration::from_secs(5));
        assert_eq!(config.processor_command.as_deref(), Some("python3 assess.py"));
    }

    #[test]
    fn supervisor_timeout_must_exceed_heartbeat_interval() {
        let args = parse(&["--heartbeat-interval", "30s", "--supervisor-timeout", "30s"]);
        let err = PipelineConfig::from_args(args, None).expect_err("invalid");
        assert!(err.to_string().contains("heartbeat interval"));
    }

    #[test]
    fn supervisor_timeout_must_exceed_long_delay() {
        let args = parse(&["--long-delay", "45s"]);
        let err = PipelineConfig::from_args(args, None).expect_err("invalid");
        assert!(err.to_string().contains("long retry delay"));
    }

    #[test]
    fn watchdog_timeout_drives_heartbeat_defaults() {
        let config =
            PipelineConfig::from_args(PipelineCliArgs::default(), Some(Duration::from_secs(60)))
                .expect("config");
        assert_eq!(config.heartbeat.supervisor_timeout, Duration::from_secs(60));
        assert_eq!(config.heartbeat.interval, Duration::from_secs(30));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for args in [
            parse(&["--jpeg-quality", "0"]),
            parse(&["--quick-attempts", "0"]),
            parse(&["--target-fps", "0"]),
            parse(&["--width", "-4"]),
        ] {
            assert!(PipelineConfig::from_args(args, None).is_err());
        }
    }

    #[test]
    fn processor_timeout_is_configurable_and_bounded() {
        let args = parse(&["--processor-timeout", "750ms"]);
        let config = PipelineConfig::from_args(args, None).expect("config");
        assert_eq!(config.processor_timeout, Duration::from_millis(750));

        let args = parse(&["--processor-timeout", "0s"]);
        assert!(PipelineConfig::from_args(args, None).is_err());

        let args = parse(&["--processor-timeout", "20s"]);
        let err = PipelineConfig::from_args(args, None).expect_err("exceeds watchdog budget");
        assert!(err.to_string().contains("processor timeouts"));
    }

    #[test]
    fn blank_processor_command_is_ignored() {
        let args = parse(&["--processor-cmd", "   "]);
        let config = PipelineConfig::from_args(args, None).expect("config");
        assert_eq!(config.processor_command, None);
    }
}
