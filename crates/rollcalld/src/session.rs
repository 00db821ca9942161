//! Attendance session: camera lifecycle and the per-tick recognition cycle.
//!
//! A `Session` owns everything a running kiosk needs: the capture engine,
//! the loaded gallery, the recent-attendance list and the last outcome
//! shown to the user. `start` acquires the camera and begins sampling;
//! `stop` releases it. No cycle runs once stopped.

use crate::engine::{self, EngineError, EngineHandle};
use crate::extractor::{CommandExtractor, FaceExtractor, FrameSource};
use crate::store::{NewAttendance, Store, StoreError};
use chrono::{DateTime, Local};
use rollcall_core::{
    Descriptor, DescriptorError, EuclideanMatcher, Gallery, LatePolicy, Matcher, Person,
};
use rollcall_hw::Camera;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("{0}")]
    InvalidInput(String),
    #[error("unknown person: {0}")]
    UnknownPerson(String),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Opens the camera and extractor when a session starts.
pub trait CaptureFactory: Send + Sync {
    fn open(&self) -> Result<(Box<dyn FrameSource>, Box<dyn FaceExtractor>), EngineError>;
}

/// V4L2 camera plus the external command extractor.
pub struct HardwareCapture {
    pub camera_device: String,
    pub width: u32,
    pub height: u32,
    pub extractor_command: PathBuf,
    pub extractor_args: Vec<String>,
}

impl CaptureFactory for HardwareCapture {
    fn open(&self) -> Result<(Box<dyn FrameSource>, Box<dyn FaceExtractor>), EngineError> {
        if !self.extractor_command.exists() {
            return Err(EngineError::Extractor(crate::extractor::ExtractorError::Spawn {
                program: self.extractor_command.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "extractor not installed",
                ),
            }));
        }
        let camera = Camera::open(&self.camera_device, self.width, self.height)?;
        tracing::info!(
            device = %self.camera_device,
            width = camera.width,
            height = camera.height,
            format = ?camera.pixel_format(),
            "camera acquired"
        );
        let extractor = CommandExtractor::new(
            self.extractor_command.clone(),
            self.extractor_args.clone(),
        );
        Ok((Box::new(camera), Box::new(extractor)))
    }
}

/// Tunables for a session, taken from the daemon config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub sample_interval: Duration,
    pub warmup_frames: usize,
    pub frames_per_enroll: usize,
    pub recent_capacity: usize,
    pub match_threshold: f32,
    pub late_policy: LatePolicy,
}

/// An accepted arrival, as shown in the recent-attendance list.
#[derive(Debug, Clone, Serialize)]
pub struct RecentEntry {
    pub name: String,
    pub class: String,
    pub confidence: f32,
    pub is_late: bool,
    pub late_count: u32,
    pub at: DateTime<Local>,
}

/// What one detection cycle concluded.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No face in frame; clears any previous overlay.
    NoDetection,
    /// A face that matched nobody in the gallery.
    Unknown { nearest_distance: Option<f32> },
    /// Matched an id whose display info could not be read.
    AccessDenied,
    /// Written to the store and pushed onto the recent list.
    Recorded { entry: RecentEntry },
    /// A more confident row for this person already exists today.
    Duplicate { name: String, confidence: f32 },
    /// Recognised, but the write failed.
    Unsaved { name: String, confidence: f32 },
    /// Capture or extraction failed for this cycle.
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub gallery_size: usize,
    pub gallery_skipped: usize,
    pub recent_count: usize,
    pub last_outcome: Option<CycleOutcome>,
    /// Persistent acquisition error; cleared by the next successful start.
    pub error: Option<String>,
}

struct Running {
    engine: EngineHandle,
    ticker: JoinHandle<()>,
    generation: u64,
}

#[derive(Default)]
struct State {
    running: Option<Running>,
    generation: u64,
    gallery: Arc<Gallery>,
    recent: VecDeque<RecentEntry>,
    last_outcome: Option<CycleOutcome>,
    banner: Option<String>,
}

pub struct Session {
    store: Store,
    factory: Arc<dyn CaptureFactory>,
    settings: SessionSettings,
    matcher: EuclideanMatcher,
    state: Mutex<State>,
    /// Held while the camera is being opened or used outside a running
    /// session, so it is opened at most once.
    camera: Mutex<()>,
}

impl Session {
    pub fn new(
        store: Store,
        factory: Arc<dyn CaptureFactory>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let matcher = EuclideanMatcher {
            threshold: settings.match_threshold,
        };
        Arc::new(Self {
            store,
            factory,
            settings,
            matcher,
            state: Mutex::new(State::default()),
            camera: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Acquire the camera, load the gallery and begin sampling.
    ///
    /// Starting an already running session does nothing. Failures are kept
    /// as the session's error banner until the next successful start.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        let _camera = self.camera.lock().await;
        if self.state.lock().await.running.is_some() {
            return Ok(());
        }

        // Opening the camera can take seconds; the state lock is not held
        // meanwhile so status and record queries keep answering.
        let (engine, gallery) = match self.acquire().await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(error = %err, "failed to start attendance session");
                self.state.lock().await.banner = Some(err.to_string());
                return Err(err);
            }
        };

        let mut state = self.state.lock().await;
        state.generation += 1;
        let generation = state.generation;
        state.gallery = Arc::new(gallery);
        state.banner = None;
        state.last_outcome = None;

        let session = Arc::clone(self);
        let period = self.settings.sample_interval;
        let ticker = tokio::spawn(async move {
            let first = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(first, period);
            // A slow cycle delays the next one instead of overlapping it.
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                session.run_cycle(Local::now()).await;
            }
        });

        state.running = Some(Running {
            engine,
            ticker,
            generation,
        });
        tracing::info!(
            gallery = state.gallery.len(),
            interval_ms = period.as_millis() as u64,
            "attendance session started"
        );
        Ok(())
    }

    async fn acquire(&self) -> Result<(EngineHandle, Gallery), SessionError> {
        let gallery = self.load_gallery().await?;
        let engine = self.open_engine().await?;
        Ok((engine, gallery))
    }

    async fn open_engine(&self) -> Result<EngineHandle, SessionError> {
        let factory = Arc::clone(&self.factory);
        let warmup = self.settings.warmup_frames;
        let engine = tokio::task::spawn_blocking(move || {
            let (source, extractor) = factory.open()?;
            engine::spawn_engine(source, extractor, warmup)
        })
        .await??;
        Ok(engine)
    }

    async fn load_gallery(&self) -> Result<Gallery, SessionError> {
        let rows = self.store.recognition_gallery().await?;
        let gallery = Gallery::from_rows(rows);
        if gallery.skipped() > 0 {
            tracing::warn!(
                skipped = gallery.skipped(),
                "some stored descriptors could not be used"
            );
        }
        Ok(gallery)
    }

    async fn reload_gallery(&self) -> Result<(), SessionError> {
        let gallery = self.load_gallery().await?;
        self.state.lock().await.gallery = Arc::new(gallery);
        Ok(())
    }

    /// Stop sampling and release the camera. Returns whether it was running.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.take() else {
            return false;
        };
        running.ticker.abort();
        drop(running.engine);
        state.last_outcome = None;
        tracing::info!("attendance session stopped");
        true
    }

    /// Run one detect → match → record cycle at wall-clock time `now`.
    ///
    /// Returns `None` when the session is not running.
    pub async fn run_cycle(&self, now: DateTime<Local>) -> Option<CycleOutcome> {
        let (engine, gallery, generation) = {
            let state = self.state.lock().await;
            let running = state.running.as_ref()?;
            (running.engine.clone(), Arc::clone(&state.gallery), running.generation)
        };

        let outcome = self.evaluate(&engine, &gallery, now).await;

        let mut state = self.state.lock().await;
        // Stopped (or restarted) while this cycle was in flight.
        if state.running.as_ref().map(|r| r.generation) != Some(generation) {
            return None;
        }
        if let CycleOutcome::Recorded { entry } = &outcome {
            state.recent.push_front(entry.clone());
            state.recent.truncate(self.settings.recent_capacity);
        }
        state.last_outcome = Some(outcome.clone());
        Some(outcome)
    }

    async fn evaluate(
        &self,
        engine: &EngineHandle,
        gallery: &Gallery,
        now: DateTime<Local>,
    ) -> CycleOutcome {
        let detection = match engine.detect().await {
            Ok(Some(d)) => d,
            Ok(None) => return CycleOutcome::NoDetection,
            Err(err) => {
                tracing::warn!(error = %err, "detection failed");
                return CycleOutcome::Failed {
                    error: err.to_string(),
                };
            }
        };

        tracing::debug!(
            score = detection.score,
            bbox = ?detection.bounding_box,
            landmarks = detection.landmarks.len(),
            "face detected"
        );
        let result = self.matcher.compare(&detection.descriptor, gallery);
        let (Some(person_id), true) = (result.person_id, result.matched) else {
            tracing::debug!(
                nearest = ?result.nearest_distance,
                "face did not match any registered person"
            );
            return CycleOutcome::Unknown {
                nearest_distance: result.nearest_distance,
            };
        };

        let info = match self.store.basic_info(&person_id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                tracing::warn!(person_id = %person_id, "matched id has no display info");
                return CycleOutcome::AccessDenied;
            }
            Err(err) => {
                tracing::error!(
                    person_id = %person_id,
                    error = %err,
                    "failed to look up matched person"
                );
                return CycleOutcome::AccessDenied;
            }
        };

        let confidence = result.confidence;
        let new = NewAttendance {
            person_id,
            info: info.clone(),
            confidence,
            at: now,
        };
        match self.store.record_attendance(new, &self.settings.late_policy).await {
            Ok(out) => match out.record {
                Some(record) => {
                    if out.escalated {
                        tracing::info!(
                            class = %record.person_class,
                            late_count = record.late_count,
                            "person added to late-comers roster"
                        );
                    }
                    tracing::info!(
                        class = %record.person_class,
                        confidence,
                        is_late = record.is_late,
                        decision = ?out.decision,
                        "attendance recorded"
                    );
                    CycleOutcome::Recorded {
                        entry: RecentEntry {
                            name: record.person_name,
                            class: record.person_class,
                            confidence,
                            is_late: record.is_late,
                            late_count: record.late_count,
                            at: record.created_at,
                        },
                    }
                }
                None => CycleOutcome::Duplicate {
                    name: info.name,
                    confidence,
                },
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to save attendance");
                CycleOutcome::Unsaved {
                    name: info.name,
                    confidence,
                }
            }
        }
    }

    /// Capture a face and register a new person with it.
    pub async fn register(&self, name: &str, class: &str) -> Result<Person, SessionError> {
        let (name, class) = validate_identity(name, class)?;
        let enrolled = self.enroll().await?;
        let person = self
            .store
            .add_person(name, class, &enrolled.detection.descriptor)
            .await?;
        self.reload_gallery().await?;
        Ok(person)
    }

    /// Register a new person with a descriptor captured elsewhere.
    pub async fn register_descriptor(
        &self,
        name: &str,
        class: &str,
        descriptor_text: &str,
    ) -> Result<Person, SessionError> {
        let (name, class) = validate_identity(name, class)?;
        let descriptor = Descriptor::parse(descriptor_text)?;
        let person = self.store.add_person(name, class, &descriptor).await?;
        self.reload_gallery().await?;
        Ok(person)
    }

    /// Capture a fresh face for an existing person.
    pub async fn reenroll(&self, person_id: &str) -> Result<(), SessionError> {
        if self.store.basic_info(person_id).await?.is_none() {
            return Err(SessionError::UnknownPerson(person_id.to_string()));
        }
        let enrolled = self.enroll().await?;
        self.store
            .replace_descriptor(person_id, &enrolled.detection.descriptor)
            .await?;
        self.reload_gallery().await?;
        tracing::info!(person_id, "descriptor replaced");
        Ok(())
    }

    pub async fn remove_person(&self, person_id: &str) -> Result<bool, SessionError> {
        let removed = self.store.remove_person(person_id).await?;
        if removed {
            self.reload_gallery().await?;
        }
        Ok(removed)
    }

    /// Enroll through the running engine, or a temporary one if stopped.
    async fn enroll(&self) -> Result<engine::EnrollResult, SessionError> {
        let _camera = self.camera.lock().await;
        let running = self
            .state
            .lock()
            .await
            .running
            .as_ref()
            .map(|r| r.engine.clone());
        let engine = match running {
            Some(engine) => engine,
            None => self.open_engine().await?,
        };
        let enrolled = engine.enroll(self.settings.frames_per_enroll).await?;
        tracing::info!(
            frames_with_face = enrolled.frames_with_face,
            score = enrolled.detection.score,
            "face captured for enrollment"
        );
        Ok(enrolled)
    }

    /// Newest first.
    pub async fn recent(&self) -> Vec<RecentEntry> {
        self.state.lock().await.recent.iter().cloned().collect()
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        SessionStatus {
            running: state.running.is_some(),
            gallery_size: state.gallery.len(),
            gallery_skipped: state.gallery.skipped(),
            recent_count: state.recent.len(),
            last_outcome: state.last_outcome.clone(),
            error: state.banner.clone(),
        }
    }
}

fn validate_identity<'a>(
    name: &'a str,
    class: &'a str,
) -> Result<(&'a str, &'a str), SessionError> {
    let (name, class) = (name.trim(), class.trim());
    if name.is_empty() || class.is_empty() {
        return Err(SessionError::InvalidInput(
            "name and class are both required".into(),
        ));
    }
    Ok((name, class))
}
