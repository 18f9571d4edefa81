//! Posture assessor collaborators.
//!
//! The pose model and the geometric classifier live outside this crate. The
//! pipeline only sees [`PostureProcessor::process`]; an error (or panic)
//! from it is a processing fault, never an acquisition fault.

use std::{
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use serde::{Deserialize, Serialize};
use tracing::debug;
use video_ingest::Frame;

use crate::{
    error::ProcessingError,
    pipeline::{
        data::{Assessment, PostureState},
        telemetry,
    },
};

pub trait PostureProcessor: Send {
    fn process(&mut self, frame: &Frame) -> Result<Assessment, ProcessingError>;
}

impl<T: PostureProcessor + ?Sized> PostureProcessor for Box<T> {
    fn process(&mut self, frame: &Frame) -> Result<Assessment, ProcessingError> {
        (**self).process(frame)
    }
}

/// Reports nobody present. Used when no assessor is configured so the
/// camera feed still reaches viewers.
#[derive(Debug, Default)]
pub struct AbsentSubjectProcessor;

impl PostureProcessor for AbsentSubjectProcessor {
    fn process(&mut self, _frame: &Frame) -> Result<Assessment, ProcessingError> {
        Ok(Assessment::absent())
    }
}

#[derive(Serialize)]
struct FrameHeader<'a> {
    width: i32,
    height: i32,
    format: &'a str,
    len: usize,
}

#[derive(Deserialize)]
struct AssessorReply {
    presence: bool,
    posture: ReplyPosture,
    confidence: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReplyPosture {
    Good,
    Bad,
    Unknown,
}

impl From<ReplyPosture> for PostureState {
    fn from(posture: ReplyPosture) -> Self {
        match posture {
            ReplyPosture::Good => PostureState::Good,
            ReplyPosture::Bad => PostureState::Bad,
            ReplyPosture::Unknown => PostureState::Unknown,
        }
    }
}

/// Parse one reply line from the assessor process.
pub(crate) fn parse_reply(line: &str) -> Result<Assessment, ProcessingError> {
    let reply: AssessorReply = serde_json::from_str(line.trim())
        .map_err(|err| ProcessingError::Protocol(format!("{err}: {:?}", line.trim())))?;
    let mut assessment = Assessment {
        presence: reply.presence,
        posture: reply.posture.into(),
        confidence: reply.confidence,
    }
    .normalized();
    if !assessment.presence {
        assessment.posture = PostureState::Unknown;
    }
    Ok(assessment)
}

type Reply = Result<Assessment, ProcessingError>;

/// Longest a frame may wait for the assessor's reply by default.
pub const DEFAULT_PROCESSOR_TIMEOUT: Duration = Duration::from_secs(2);

/// A running assessor. Pipe I/O happens on a helper thread so a child that
/// stops reading or answering can only cost the caller `timeout`.
struct AssessorChild {
    child: Child,
    frames: Sender<Frame>,
    replies: Receiver<Reply>,
}

impl AssessorChild {
    fn assess(&self, frame: &Frame, timeout: Duration) -> Reply {
        self.frames.try_send(frame.clone()).map_err(|_| {
            ProcessingError::Protocol("assessor I/O thread is gone".to_string())
        })?;
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(ProcessingError::Timeout { waited: timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(ProcessingError::Protocol(
                "assessor closed its output".to_string(),
            )),
        }
    }

    /// Killing the child closes its pipes, which ends the I/O thread. The
    /// thread is not joined.
    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Drives an external assessor over stdin/stdout.
///
/// Per frame the child receives one JSON header line
/// (`{"width","height","format","len"}`) followed by `len` raw pixel bytes,
/// and answers with one JSON line
/// `{"presence": bool, "posture": "good"|"bad"|"unknown", "confidence": f}`.
/// The child is (re)spawned lazily; after any failure, including a reply
/// slower than the configured timeout, it is killed and the next frame
/// starts a fresh one.
pub struct SubprocessProcessor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    child: Option<AssessorChild>,
    spawned: u64,
}

impl SubprocessProcessor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_PROCESSOR_TIMEOUT,
            child: None,
            spawned: 0,
        }
    }

    /// Split a shell-like command line on whitespace into program and args.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of assessor processes started so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawned
    }

    fn spawn(&mut self) -> Result<AssessorChild, ProcessingError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessingError::Protocol(
                "assessor stdio not captured".to_string(),
            ));
        };

        let (frames_tx, frames_rx) = bounded::<Frame>(1);
        let (replies_tx, replies_rx) = bounded::<Reply>(1);
        let io = telemetry::spawn_thread("posture-assessor-io", move || {
            assessor_io(stdin, BufReader::new(stdout), frames_rx, replies_tx)
        });
        if let Err(err) = io {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err.into());
        }

        self.spawned = self.spawned.wrapping_add(1);
        debug!(
            program = %self.program.display(),
            pid = child.id(),
            "assessor process started"
        );
        Ok(AssessorChild {
            child,
            frames: frames_tx,
            replies: replies_rx,
        })
    }
}

/// Serve frames to the child one at a time until the caller goes away or an
/// exchange fails.
fn assessor_io(
    mut stdin: ChildStdin,
    mut stdout: BufReader<ChildStdout>,
    frames: Receiver<Frame>,
    replies: Sender<Reply>,
) {
    for frame in frames.iter() {
        let reply = exchange(&mut stdin, &mut stdout, &frame);
        let failed = reply.is_err();
        if replies.send(reply).is_err() || failed {
            break;
        }
    }
}

fn exchange(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    frame: &Frame,
) -> Reply {
    let header = FrameHeader {
        width: frame.width,
        height: frame.height,
        format: frame.format.label(),
        len: frame.data.len(),
    };
    let mut line =
        serde_json::to_vec(&header).map_err(|err| ProcessingError::Protocol(err.to_string()))?;
    line.push(b'\n');
    stdin.write_all(&line)?;
    stdin.write_all(&frame.data)?;
    stdin.flush()?;

    let mut reply = String::new();
    if stdout.read_line(&mut reply)? == 0 {
        return Err(ProcessingError::Protocol(
            "assessor closed its output".to_string(),
        ));
    }
    parse_reply(&reply)
}

impl PostureProcessor for SubprocessProcessor {
    fn process(&mut self, frame: &Frame) -> Result<Assessment, ProcessingError> {
        let child = match self.child.take() {
            Some(child) => child,
            None => self.spawn()?,
        };
        match child.assess(frame, self.timeout) {
            Ok(assessment) => {
                self.child = Some(child);
                Ok(assessment)
            }
            Err(err) => {
                debug!("assessor exchange failed, restarting it on the next frame: {err}");
                child.kill();
                Err(err)
            }
        }
    }
}

impl Drop for SubprocessProcessor {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            child.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use video_ingest::FrameFormat;

    use super::*;

    fn frame() -> Frame {
        Frame {
            data: vec![0; 2 * 2 * 3],
            width: 2,
            height: 2,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn absent_processor_reports_unknown() {
        let assessment = AbsentSubjectProcessor.process(&frame()).expect("assessment");
        assert_eq!(assessment, Assessment::absent());
    }

    #[test]
    fn parses_reply_and_clamps_confidence() {
        let assessment =
            parse_reply(r#"{"presence": true, "posture": "bad", "confidence": 1.4}"#)
                .expect("reply");
        assert!(assessment.presence);
        assert_eq!(assessment.posture, PostureState::Bad);
        assert_eq!(assessment.confidence, 1.0);
    }

    #[test]
    fn absent_reply_forces_unknown_posture() {
        let assessment =
            parse_reply(r#"{"presence": false, "posture": "good", "confidence": 0.1}"#)
                .expect("reply");
        assert_eq!(assessment.posture, PostureState::Unknown);
    }

    #[test]
    fn malformed_reply_is_protocol_error() {
        assert!(matches!(
            parse_reply("not json"),
            Err(ProcessingError::Protocol(_))
        ));
    }

    #[test]
    fn missing_program_is_processing_error() {
        let mut processor = SubprocessProcessor::new("/nonexistent/assessor", Vec::new());
        assert!(matches!(
            processor.process(&frame()),
            Err(ProcessingError::Io(_))
        ));
        assert_eq!(processor.spawn_count(), 0);
    }

    #[test]
    fn talks_to_assessor_process() {
        // Reads the header and the 12 pixel bytes, then answers.
        let script = r#"while IFS= read -r header; do head -c 12 >/dev/null; echo '{"presence":true,"posture":"good","confidence":0.9}'; done"#;
        let mut processor =
            SubprocessProcessor::new("sh", vec!["-c".to_string(), script.to_string()]);
        for _ in 0..2 {
            let assessment = processor.process(&frame()).expect("assessment");
            assert_eq!(assessment.posture, PostureState::Good);
            assert!(assessment.presence);
        }
        assert_eq!(processor.spawn_count(), 1);
    }

    #[test]
    fn silent_assessor_times_out_and_is_replaced() {
        let mut processor = SubprocessProcessor::new(
            "sh",
            vec!["-c".to_string(), "cat >/dev/null".to_string()],
        )
        .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        assert!(matches!(
            processor.process(&frame()),
            Err(ProcessingError::Timeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(processor.spawn_count(), 1);
        assert!(processor.child.is_none());

        assert!(processor.process(&frame()).is_err());
        assert_eq!(processor.spawn_count(), 2);
    }

    #[test]
    fn exited_assessor_is_respawned_on_the_next_frame() {
        // Answers exactly one frame, then exits.
        let script = r#"IFS= read -r header; head -c 12 >/dev/null; echo '{"presence":true,"posture":"bad","confidence":0.6}'"#;
        let mut processor =
            SubprocessProcessor::new("sh", vec!["-c".to_string(), script.to_string()]);

        let first = processor.process(&frame()).expect("first reply");
        assert_eq!(first.posture, PostureState::Bad);
        assert!(processor.process(&frame()).is_err());
        assert_eq!(processor.spawn_count(), 1);

        let third = processor.process(&frame()).expect("respawned reply");
        assert_eq!(third.posture, PostureState::Bad);
        assert_eq!(processor.spawn_count(), 2);
    }

    #[test]
    fn garbage_reply_restarts_the_assessor() {
        let script = r#"while IFS= read -r header; do head -c 12 >/dev/null; echo 'not json'; done"#;
        let mut processor =
            SubprocessProcessor::new("sh", vec!["-c".to_string(), script.to_string()]);
        for expected_spawns in 1..=2 {
            assert!(matches!(
                processor.process(&frame()),
                Err(ProcessingError::Protocol(_))
            ));
            assert_eq!(processor.spawn_count(), expected_spawns);
        }
    }

    #[test]
    fn command_line_splits_program_and_args() {
        let processor =
            SubprocessProcessor::from_command_line("python3 assess.py --model pose.onnx")
                .expect("command");
        assert_eq!(processor.program, PathBuf::from("python3"));
        assert_eq!(processor.args, vec!["assess.py", "--model", "pose.onnx"]);
        assert!(SubprocessProcessor::from_command_line("   ").is_none());
    }
}
