use crate::extractor::{Detection, ExtractorError, FaceExtractor, FrameSource};
use rollcall_hw::CameraError;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("no face detected in any captured frame")]
    NoFaceDetected,
    #[error("failed to start engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of an enrollment capture.
#[derive(Debug, Clone)]
pub struct EnrollResult {
    /// Highest-scoring detection across the captured frames.
    pub detection: Detection,
    pub frames_with_face: usize,
}

/// Messages sent from the session to the engine thread.
enum EngineRequest {
    Detect {
        reply: oneshot::Sender<Result<Option<Detection>, EngineError>>,
    },
    Enroll {
        frames_count: usize,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread. The thread, and the camera it
/// owns, go away once every handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture one frame and extract the primary face, if any.
    pub async fn detect(&self) -> Result<Option<Detection>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Capture several frames and keep the best-scoring face.
    pub async fn enroll(&self, frames_count: usize) -> Result<EnrollResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                frames_count,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Takes ownership of an already-opened frame source and extractor,
/// discards warmup frames, then serves requests until every handle is
/// dropped.
pub fn spawn_engine(
    mut source: Box<dyn FrameSource>,
    mut extractor: Box<dyn FaceExtractor>,
    warmup_frames: usize,
) -> Result<EngineHandle, EngineError> {
    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            let _ = source.capture();
        }
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { reply } => {
                        let result = run_detect(source.as_mut(), extractor.as_mut());
                        let _ = reply.send(result);
                    }
                    EngineRequest::Enroll {
                        frames_count,
                        reply,
                    } => {
                        let result =
                            run_enroll(source.as_mut(), extractor.as_mut(), frames_count);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_detect(
    source: &mut dyn FrameSource,
    extractor: &mut dyn FaceExtractor,
) -> Result<Option<Detection>, EngineError> {
    let frame = source.capture()?;
    if frame.is_dark {
        tracing::debug!(seq = frame.sequence, "detect: dark frame");
        return Ok(None);
    }
    Ok(extractor.extract(&frame)?)
}

fn run_enroll(
    source: &mut dyn FrameSource,
    extractor: &mut dyn FaceExtractor,
    frames_count: usize,
) -> Result<EnrollResult, EngineError> {
    let mut best: Option<Detection> = None;
    let mut frames_with_face = 0usize;

    for _ in 0..frames_count {
        let frame = source.capture()?;
        if frame.is_dark {
            tracing::debug!(seq = frame.sequence, "enroll: skipping dark frame");
            continue;
        }
        let Some(detection) = extractor.extract(&frame)? else {
            continue;
        };
        frames_with_face += 1;
        if best.as_ref().map_or(true, |b| detection.score > b.score) {
            best = Some(detection);
        }
    }

    let detection = best.ok_or(EngineError::NoFaceDetected)?;
    tracing::info!(
        score = detection.score,
        frames_with_face,
        frames_count,
        "enroll: best face selected"
    );
    Ok(EnrollResult {
        detection,
        frames_with_face,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rollcall_core::{Descriptor, DESCRIPTOR_DIM};
    use rollcall_hw::Frame;
    use std::collections::VecDeque;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    /// Frame source yielding bright frames, or dark ones where scripted.
    pub(crate) struct FakeSource {
        pub dark: VecDeque<bool>,
        pub dropped: Option<std_mpsc::Sender<()>>,
    }

    impl FakeSource {
        pub(crate) fn bright() -> Self {
            Self {
                dark: VecDeque::new(),
                dropped: None,
            }
        }
    }

    impl FrameSource for FakeSource {
        fn capture(&mut self) -> Result<Frame, CameraError> {
            let dark = self.dark.pop_front().unwrap_or(false);
            let value = if dark { 0u8 } else { 150u8 };
            Ok(Frame::from_rgb(vec![value; 2 * 2 * 3], 2, 2, 0)?)
        }
    }

    impl Drop for FakeSource {
        fn drop(&mut self) {
            if let Some(tx) = self.dropped.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Extractor replaying a script of replies; `None` entries mean "no face".
    /// Once the script runs out the last entry repeats.
    pub(crate) struct ScriptedExtractor {
        pub replies: VecDeque<Option<(f32, Descriptor)>>,
        pub last: Option<(f32, Descriptor)>,
    }

    impl ScriptedExtractor {
        pub(crate) fn new(replies: Vec<Option<(f32, Descriptor)>>) -> Self {
            Self {
                replies: replies.into(),
                last: None,
            }
        }
    }

    impl FaceExtractor for ScriptedExtractor {
        fn extract(&mut self, _frame: &Frame) -> Result<Option<Detection>, ExtractorError> {
            if let Some(next) = self.replies.pop_front() {
                self.last = next;
            }
            Ok(self.last.clone().map(|(score, descriptor)| Detection {
                score,
                bounding_box: None,
                landmarks: Vec::new(),
                descriptor,
            }))
        }
    }

    pub(crate) fn descriptor(v: f32) -> Descriptor {
        Descriptor::new(vec![v; DESCRIPTOR_DIM]).unwrap()
    }

    #[tokio::test]
    async fn test_detect_returns_face() {
        let extractor = ScriptedExtractor::new(vec![Some((0.9, descriptor(0.2)))]);
        let engine = spawn_engine(Box::new(FakeSource::bright()), Box::new(extractor), 2).unwrap();
        let detection = engine.detect().await.unwrap().unwrap();
        assert_eq!(detection.descriptor, descriptor(0.2));
    }

    #[tokio::test]
    async fn test_dark_frame_is_no_detection() {
        let source = FakeSource {
            dark: VecDeque::from(vec![true]),
            dropped: None,
        };
        let extractor = ScriptedExtractor::new(vec![Some((0.9, descriptor(0.2)))]);
        let engine = spawn_engine(Box::new(source), Box::new(extractor), 0).unwrap();
        assert!(engine.detect().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enroll_keeps_best_score() {
        let extractor = ScriptedExtractor::new(vec![
            Some((0.5, descriptor(0.1))),
            None,
            Some((0.95, descriptor(0.3))),
            Some((0.7, descriptor(0.2))),
        ]);
        let engine = spawn_engine(Box::new(FakeSource::bright()), Box::new(extractor), 0).unwrap();
        let result = engine.enroll(4).await.unwrap();
        assert_eq!(result.frames_with_face, 3);
        assert_eq!(result.detection.descriptor, descriptor(0.3));
    }

    #[tokio::test]
    async fn test_enroll_without_face_fails() {
        let extractor = ScriptedExtractor::new(vec![None]);
        let engine = spawn_engine(Box::new(FakeSource::bright()), Box::new(extractor), 0).unwrap();
        assert!(matches!(engine.enroll(3).await, Err(EngineError::NoFaceDetected)));
    }

    #[tokio::test]
    async fn test_dropping_handle_releases_source() {
        let (tx, rx) = std_mpsc::channel();
        let source = FakeSource {
            dark: VecDeque::new(),
            dropped: Some(tx),
        };
        let extractor = ScriptedExtractor::new(vec![None]);
        let engine = spawn_engine(Box::new(source), Box::new(extractor), 0).unwrap();
        drop(engine);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
