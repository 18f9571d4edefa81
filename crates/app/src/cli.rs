use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use posture::{
    AbsentSubjectProcessor, PipelineCliArgs, PostureProcessor, SubprocessProcessor,
    pipeline::config::CameraConfig,
};
use video_ingest::{CaptureSource, FfmpegCapture, FfmpegOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CaptureBackend {
    /// Raw frames piped from an `ffmpeg` child process.
    Ffmpeg,
    /// OpenCV `VideoCapture` (requires the `opencv` feature).
    Opencv,
}

#[derive(Debug, Parser)]
#[command(name = "posture-monitor")]
#[command(about = "Desk posture monitor with a live Server-Sent Events feed")]
pub struct Cli {
    #[command(flatten)]
    pub pipeline: PipelineCliArgs,

    /// Address the HTTP server listens on.
    #[arg(long, value_name = "ADDR", env = "POSTURE_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Capture backend.
    #[arg(long, value_enum, env = "POSTURE_BACKEND", default_value_t = CaptureBackend::Ffmpeg)]
    pub backend: CaptureBackend,

    /// ffmpeg executable used by the ffmpeg backend.
    #[arg(long, value_name = "PATH", env = "POSTURE_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: String,
}

/// Build the camera handle for the selected backend. The device is not
/// opened here; the producer opens it on its first iteration.
pub fn build_camera(
    backend: CaptureBackend,
    ffmpeg: &str,
    camera: &CameraConfig,
) -> Result<Box<dyn CaptureSource>> {
    match backend {
        CaptureBackend::Ffmpeg => {
            let mut options = FfmpegOptions::new(camera.uri.clone(), (camera.width, camera.height));
            options.fps = camera.fps;
            options.read_timeout = camera.read_timeout;
            options.program = ffmpeg.to_string();
            Ok(Box::new(FfmpegCapture::new(options)))
        }
        #[cfg(feature = "opencv")]
        CaptureBackend::Opencv => Ok(Box::new(video_ingest::OpenCvCapture::new(
            camera.uri.clone(),
            (camera.width, camera.height),
            camera.fps,
        ))),
        #[cfg(not(feature = "opencv"))]
        CaptureBackend::Opencv => {
            bail!("the opencv backend requires building with `--features opencv`")
        }
    }
}

/// External assessor when a command is configured, otherwise a processor
/// that reports nobody present.
pub fn build_processor(
    command: Option<&str>,
    timeout: Duration,
) -> Result<Box<dyn PostureProcessor>> {
    match command {
        Some(command) => match SubprocessProcessor::from_command_line(command) {
            Some(processor) => Ok(Box::new(processor.with_timeout(timeout))),
            None => bail!("--processor-cmd must name a program"),
        },
        None => Ok(Box::new(AbsentSubjectProcessor)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["posture-monitor"]).expect("parse");
        assert_eq!(cli.bind, "127.0.0.1:8080".parse::<SocketAddr>().expect("addr"));
        assert_eq!(cli.backend, CaptureBackend::Ffmpeg);
        assert_eq!(cli.ffmpeg, "ffmpeg");
    }

    #[test]
    fn pipeline_flags_are_flattened() {
        let cli = Cli::try_parse_from([
            "posture-monitor",
            "--bind",
            "0.0.0.0:9000",
            "--source",
            "/dev/video1",
            "--long-delay",
            "20s",
        ])
        .expect("parse");
        assert_eq!(cli.bind.port(), 9000);
        assert_eq!(cli.pipeline.source.as_deref(), Some("/dev/video1"));
        assert_eq!(
            cli.pipeline.long_delay,
            Some(Duration::from_secs(20))
        );
    }

    #[test]
    fn processor_selection() {
        let timeout = Duration::from_secs(1);
        assert!(build_processor(None, timeout).is_ok());
        assert!(build_processor(Some("python3 assess.py"), timeout).is_ok());
    }

    #[test]
    fn ffmpeg_backend_builds_without_opening() {
        let camera = CameraConfig {
            uri: "0".into(),
            width: 320,
            height: 240,
            fps: 10,
            read_timeout: Duration::from_secs(1),
        };
        let source = build_camera(CaptureBackend::Ffmpeg, "ffmpeg", &camera).expect("camera");
        assert_eq!(source.describe(), "ffmpeg:0 (320x240)");
    }
}
