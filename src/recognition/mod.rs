//! Rate-limited background face recognition
//!
//! Recognition runs on a dedicated thread so embedding inference never
//! stalls frame acquisition. Dispatch is gated by a process-wide
//! `RecognitionState`: an attempt is admitted only when no other attempt is
//! in flight and more than `interval` has passed since the last admitted
//! one. The check and the timestamp update happen under one lock, so two
//! detections in the same frame cannot both slip through.
//!
//! Outcomes are reported back over a channel; the worker never touches the
//! gallery except to query it.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::RgbImage;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::gallery::Gallery;
use crate::vision::{BoundingBox, Descriptor, FaceEmbedder, Frame};

/// Result of offering a detection to the recognizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Dispatched,
    /// Too soon after the previous attempt
    RateLimited,
    /// Previous attempt still running
    Busy,
}

#[derive(Debug)]
struct RateState {
    last_attempt: Option<Instant>,
    in_flight: bool,
}

/// Process-wide recognition rate limiter
#[derive(Debug)]
pub struct RecognitionState {
    interval: Duration,
    inner: Mutex<RateState>,
}

impl RecognitionState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(RateState {
                last_attempt: None,
                in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Admit an attempt at `now`, recording it as the last attempt
    pub fn try_begin(&self, now: Instant) -> Dispatch {
        let mut state = self.lock();

        if state.in_flight {
            return Dispatch::Busy;
        }
        if let Some(last) = state.last_attempt {
            if now.saturating_duration_since(last) <= self.interval {
                return Dispatch::RateLimited;
            }
        }

        state.last_attempt = Some(now);
        state.in_flight = true;
        Dispatch::Dispatched
    }

    /// Mark the in-flight attempt as done
    pub fn finish(&self) {
        self.lock().in_flight = false;
    }

    /// Forget the last attempt (start of a new loop run)
    pub fn reset(&self) {
        let mut state = self.lock();
        state.last_attempt = None;
        state.in_flight = false;
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.lock().last_attempt
    }
}

/// What the recognizer concluded about one detection
#[derive(Debug, Clone)]
pub enum RecognitionOutcome {
    Recognized {
        bbox: BoundingBox,
        label: String,
        distance: f32,
    },
    /// No identity within the threshold; carries what enrollment needs
    Unknown {
        bbox: BoundingBox,
        descriptor: Descriptor,
        face: RgbImage,
    },
    /// Embedding failed; treated as unknown for display but never enrolled
    Failed { bbox: BoundingBox, reason: String },
}

impl RecognitionOutcome {
    pub fn bbox(&self) -> BoundingBox {
        match self {
            Self::Recognized { bbox, .. } | Self::Unknown { bbox, .. } | Self::Failed { bbox, .. } => {
                *bbox
            }
        }
    }
}

/// Recognize one detection synchronously
pub fn recognize(
    gallery: &Gallery,
    embedder: &dyn FaceEmbedder,
    frame: &Frame,
    bbox: BoundingBox,
) -> RecognitionOutcome {
    let descriptor = match embedder.embed(frame, &bbox) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            log::warn!("Embedding failed for {}: {:#}", bbox, e);
            return RecognitionOutcome::Failed {
                bbox,
                reason: format!("{:#}", e),
            };
        }
    };

    // Empty gallery: nothing to compare against
    if !gallery.is_empty() {
        if let Some(hit) = gallery.match_descriptor(&descriptor) {
            log::debug!("Recognized '{}' at {} (d={:.3})", hit.label, bbox, hit.distance);
            return RecognitionOutcome::Recognized {
                bbox,
                label: hit.label,
                distance: hit.distance,
            };
        }
    }

    match frame.crop(&bbox) {
        Ok(face) => {
            log::debug!("Unknown face at {}", bbox);
            RecognitionOutcome::Unknown {
                bbox,
                descriptor,
                face,
            }
        }
        Err(e) => RecognitionOutcome::Failed {
            bbox,
            reason: format!("{:#}", e),
        },
    }
}

struct RecognitionJob {
    frame: Arc<Frame>,
    bbox: BoundingBox,
}

/// Background recognizer fed by `dispatch`
pub struct RecognitionWorker {
    state: Arc<RecognitionState>,
    job_tx: Option<Sender<RecognitionJob>>,
    handle: Option<JoinHandle<()>>,
}

impl RecognitionWorker {
    pub fn start(
        gallery: Arc<Gallery>,
        embedder: Arc<dyn FaceEmbedder>,
        state: Arc<RecognitionState>,
        outcome_tx: Sender<RecognitionOutcome>,
    ) -> Result<Self> {
        let (job_tx, job_rx) = bounded::<RecognitionJob>(1);
        let worker_state = Arc::clone(&state);

        let handle = std::thread::Builder::new()
            .name("recognition".into())
            .spawn(move || {
                run_recognition_worker(gallery, embedder, worker_state, job_rx, outcome_tx)
            })?;

        log::info!(
            "Recognition worker started (interval={}ms)",
            state.interval().as_millis()
        );
        Ok(Self {
            state,
            job_tx: Some(job_tx),
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> &Arc<RecognitionState> {
        &self.state
    }

    /// Offer one detection; never blocks
    pub fn dispatch(&self, frame: &Arc<Frame>, bbox: BoundingBox) -> Dispatch {
        let Some(job_tx) = &self.job_tx else {
            return Dispatch::Busy;
        };

        match self.state.try_begin(Instant::now()) {
            Dispatch::Dispatched => {}
            other => return other,
        }

        let job = RecognitionJob {
            frame: Arc::clone(frame),
            bbox,
        };
        match job_tx.try_send(job) {
            Ok(()) => Dispatch::Dispatched,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.state.finish();
                Dispatch::Busy
            }
        }
    }

    /// Stop accepting work and wait for the in-flight attempt to finish
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Recognition worker panicked");
            }
        }
    }
}

impl Drop for RecognitionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_recognition_worker(
    gallery: Arc<Gallery>,
    embedder: Arc<dyn FaceEmbedder>,
    state: Arc<RecognitionState>,
    job_rx: Receiver<RecognitionJob>,
    outcome_tx: Sender<RecognitionOutcome>,
) {
    while let Ok(job) = job_rx.recv() {
        let outcome = recognize(&gallery, embedder.as_ref(), &job.frame, job.bbox);
        state.finish();
        if outcome_tx.send(outcome).is_err() {
            break;
        }
    }
    log::debug!("Recognition worker exiting");
}
