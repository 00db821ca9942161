//! Boundary to the face detection / descriptor extraction library.
//!
//! Detection, landmarking and embedding are not done in-process. The
//! daemon hands each frame to an external extractor and consumes only its
//! numeric output: zero or one primary face with a fixed-length descriptor.

use rollcall_core::{Descriptor, DescriptorError};
use rollcall_hw::{Camera, CameraError, Frame, FrameError};
use serde::Deserialize;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("failed to encode frame: {0}")]
    Frame(#[from] FrameError),
    #[error("failed to run extractor {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("extractor i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("extractor exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("invalid extractor reply: {0}")]
    Reply(#[from] serde_json::Error),
    #[error("extractor returned a bad descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
}

/// The primary face found in a frame.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Detector score in [0, 1].
    pub score: f32,
    /// `[x, y, width, height]` in frame pixels, when the extractor reports it.
    pub bounding_box: Option<[f32; 4]>,
    pub landmarks: Vec<(f32, f32)>,
    pub descriptor: Descriptor,
}

/// Turns a frame into at most one face descriptor.
pub trait FaceExtractor: Send {
    fn extract(&mut self, frame: &Frame) -> Result<Option<Detection>, ExtractorError>;
}

/// Produces camera frames for the engine thread.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for Camera {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

#[derive(Deserialize)]
struct Reply {
    detection: Option<WireDetection>,
}

#[derive(Deserialize)]
struct WireDetection {
    score: f32,
    #[serde(default)]
    bounding_box: Option<[f32; 4]>,
    #[serde(default)]
    landmarks: Vec<[f32; 2]>,
    descriptor: Vec<f32>,
}

/// Decode an extractor reply, either `{"detection": null}` or
///
/// ```text
/// {"detection": {"score": .., "descriptor": [..], "bounding_box": [..],
///                "landmarks": [[x, y], ..]}}
/// ```
pub fn parse_reply(bytes: &[u8]) -> Result<Option<Detection>, ExtractorError> {
    let reply: Reply = serde_json::from_slice(bytes)?;
    let Some(wire) = reply.detection else {
        return Ok(None);
    };
    Ok(Some(Detection {
        score: wire.score,
        bounding_box: wire.bounding_box,
        landmarks: wire.landmarks.into_iter().map(|[x, y]| (x, y)).collect(),
        descriptor: Descriptor::new(wire.descriptor)?,
    }))
}

/// Runs an external helper program once per frame.
///
/// The frame is written to the helper's stdin as PNG; the helper prints
/// one JSON reply on stdout and exits 0.
pub struct CommandExtractor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExtractor {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    fn run(&self, input: &[u8]) -> Result<Vec<u8>, ExtractorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExtractorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // stdin is closed when the arm ends so the helper sees EOF.
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(input),
            None => Ok(()),
        };
        match written {
            Ok(()) => {}
            // The helper quit without reading; its status and stderr say why.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                tracing::debug!(program = %self.program.display(), "extractor closed stdin early");
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExtractorError::Io(e));
            }
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(ExtractorError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl FaceExtractor for CommandExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Option<Detection>, ExtractorError> {
        let png = frame.to_png()?;
        let stdout = self.run(&png)?;
        parse_reply(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::DESCRIPTOR_DIM;

    fn reply_with(descriptor_len: usize) -> String {
        serde_json::json!({
            "detection": {
                "score": 0.93,
                "bounding_box": [10.0, 20.0, 100.0, 120.0],
                "landmarks": [[30.0, 40.0], [70.0, 40.0]],
                "descriptor": vec![0.05f32; descriptor_len],
            }
        })
        .to_string()
    }

    fn grey_frame() -> Frame {
        Frame::from_rgb(vec![120u8; 4 * 4 * 3], 4, 4, 0).unwrap()
    }

    #[test]
    fn test_parse_no_face() {
        assert!(parse_reply(br#"{"detection": null}"#).unwrap().is_none());
    }

    #[test]
    fn test_parse_detection() {
        let detection = parse_reply(reply_with(DESCRIPTOR_DIM).as_bytes())
            .unwrap()
            .unwrap();
        assert!((detection.score - 0.93).abs() < 1e-6);
        assert_eq!(detection.bounding_box, Some([10.0, 20.0, 100.0, 120.0]));
        assert_eq!(detection.landmarks, vec![(30.0, 40.0), (70.0, 40.0)]);
        assert_eq!(detection.descriptor.values().len(), DESCRIPTOR_DIM);
    }

    #[test]
    fn test_parse_rejects_short_descriptor() {
        let err = parse_reply(reply_with(64).as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ExtractorError::Descriptor(DescriptorError::WrongLength(64))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_reply(b"face!"), Err(ExtractorError::Reply(_))));
    }

    #[test]
    fn test_command_extractor_reads_stdout() {
        let script = format!("cat > /dev/null; printf '%s' '{}'", reply_with(DESCRIPTOR_DIM));
        let mut extractor = CommandExtractor::new("sh".into(), vec!["-c".into(), script]);
        let detection = extractor.extract(&grey_frame()).unwrap();
        assert!(detection.is_some());
    }

    #[test]
    fn test_command_extractor_nonzero_exit() {
        let mut extractor = CommandExtractor::new(
            "sh".into(),
            vec!["-c".into(), "cat > /dev/null; echo 'model missing' >&2; exit 3".into()],
        );
        let err = extractor.extract(&grey_frame()).unwrap_err();
        match err {
            ExtractorError::Exit { stderr, .. } => assert_eq!(stderr, "model missing"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_helper_exiting_before_reading_reports_stderr() {
        // Noisy pixels so the PNG stays well above the 64 KiB pipe buffer.
        let mut state = 0x2545_f491u32;
        let data: Vec<u8> = (0..256 * 256 * 3)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect();
        let frame = Frame::from_rgb(data, 256, 256, 0).unwrap();
        assert!(frame.to_png().unwrap().len() > 64 * 1024);

        let mut extractor = CommandExtractor::new(
            "sh".into(),
            vec!["-c".into(), "echo 'model missing' >&2; exit 3".into()],
        );
        for _ in 0..3 {
            match extractor.extract(&frame).unwrap_err() {
                ExtractorError::Exit { stderr, .. } => assert_eq!(stderr, "model missing"),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_command_extractor_missing_program() {
        let mut extractor = CommandExtractor::new("/nonexistent/rollcall-extract".into(), vec![]);
        assert!(matches!(
            extractor.extract(&grey_frame()),
            Err(ExtractorError::Spawn { .. })
        ));
    }
}
