//! FFmpeg subprocess capture.
//!
//! `open` spawns `ffmpeg` decoding the source into raw BGR24 frames on stdout
//! and a reader thread that forwards them over a one-element channel. When the
//! consumer falls behind the reader replaces the pending frame, so `read`
//! always hands back the freshest frame the device produced.

use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, warn};

use crate::{
    device::parse_device_index,
    types::{CaptureError, CaptureSource, Frame, FrameFormat},
};

/// Settings for an [`FfmpegCapture`].
#[derive(Clone, Debug)]
pub struct FfmpegOptions {
    /// Device index, `/dev/videoN` path, file or network URI.
    pub uri: String,
    /// Output size (width, height); ffmpeg scales to it.
    pub target_size: (i32, i32),
    /// Requested device frame rate.
    pub fps: u32,
    /// Longest `read` waits for a frame before reporting a timeout.
    pub read_timeout: Duration,
    /// ffmpeg executable.
    pub program: String,
}

impl FfmpegOptions {
    pub fn new(uri: impl Into<String>, target_size: (i32, i32)) -> Self {
        Self {
            uri: uri.into(),
            target_size,
            fps: 15,
            read_timeout: Duration::from_secs(2),
            program: "ffmpeg".to_string(),
        }
    }
}

type FrameMessage = Result<Frame, CaptureError>;

/// Camera handle backed by an `ffmpeg` child process.
pub struct FfmpegCapture {
    options: FfmpegOptions,
    child: Option<Child>,
    frames: Option<Receiver<FrameMessage>>,
    reader: Option<thread::JoinHandle<()>>,
}

impl FfmpegCapture {
    pub fn new(options: FfmpegOptions) -> Self {
        Self {
            options,
            child: None,
            frames: None,
            reader: None,
        }
    }

    fn build_command(&self) -> Command {
        let (width, height) = self.options.target_size;
        let scale_arg = format!("scale={width}:{height}");
        let uri = &self.options.uri;

        let mut cmd = Command::new(&self.options.program);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay");

        let device = parse_device_index(uri).map(|index| format!("/dev/video{index}"));
        if let Some(device) = device {
            cmd.arg("-f")
                .arg("video4linux2")
                .arg("-framerate")
                .arg(self.options.fps.to_string())
                .arg("-video_size")
                .arg(format!("{width}x{height}"))
                .arg("-i")
                .arg(device);
        } else {
            cmd.arg("-i").arg(uri);
        }

        cmd.arg("-an")
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl CaptureSource for FfmpegCapture {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.close();

        let mut child = self.build_command().spawn().map_err(|err| {
            warn!(uri = %self.options.uri, "failed to spawn ffmpeg: {err}");
            CaptureError::Open {
                uri: self.options.uri.clone(),
            }
        })?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
        };

        let (tx, rx) = bounded::<FrameMessage>(1);
        let drain = rx.clone();
        let target_size = self.options.target_size;
        let reader = thread::Builder::new()
            .name("ffmpeg-capture-reader".into())
            .spawn(move || reader_loop(stdout, target_size, tx, drain))
            .map_err(|err| CaptureError::Other(err.into()));
        let reader = match reader {
            Ok(reader) => reader,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        debug!(uri = %self.options.uri, pid = child.id(), "ffmpeg capture started");
        self.child = Some(child);
        self.frames = Some(rx);
        self.reader = Some(reader);
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        let frames = self.frames.as_ref().ok_or(CaptureError::Closed)?;
        match frames.recv_timeout(self.options.read_timeout) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout {
                waited: self.options.read_timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        }
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        // The reader never blocks on the channel; it exits at stdout EOF.
        self.frames = None;
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn describe(&self) -> String {
        let (width, height) = self.options.target_size;
        format!("ffmpeg:{} ({width}x{height})", self.options.uri)
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(
    mut stdout: ChildStdout,
    target_size: (i32, i32),
    tx: Sender<FrameMessage>,
    drain: Receiver<FrameMessage>,
) {
    let frame_bytes = Frame::expected_len(target_size.0, target_size.1, FrameFormat::Bgr8);
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        let message = match stdout.read_exact(&mut buffer) {
            Ok(()) => Ok(Frame {
                data: buffer.clone(),
                width: target_size.0,
                height: target_size.1,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            }),
            Err(err) => Err(CaptureError::Other(err.into())),
        };
        let terminal = message.is_err();
        if !forward_latest(&tx, &drain, message) || terminal {
            break;
        }
    }
}

/// Push `message`, evicting a stale pending frame if the consumer has not
/// picked it up yet. Returns `false` once the consumer is gone.
fn forward_latest(
    tx: &Sender<FrameMessage>,
    drain: &Receiver<FrameMessage>,
    mut message: FrameMessage,
) -> bool {
    loop {
        match tx.try_send(message) {
            Ok(()) => return true,
            Err(TrySendError::Full(rejected)) => {
                let _ = drain.try_recv();
                message = rejected;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}
