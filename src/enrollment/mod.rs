//! Voice-driven enrollment of unrecognized faces
//!
//! Each unknown detection starts an independent session:
//!
//! ```text
//! UNKNOWN -> CAPTURING -> LISTENING -> RESOLVED -> ENROLLED
//!                |            |           |
//!                +------------+-----------+--> ABANDONED
//! ```
//!
//! Sessions run on a small worker pool because recording blocks for
//! seconds. There is no retry inside a session; the next unknown detection
//! of the same person simply starts a new one.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::{ImageFormat, RgbImage};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::archive::FaceArchive;
use crate::audio::recorder::AudioRecorder;
use crate::gallery::{Gallery, GalleryError};
use crate::speech::{normalize_label, Transcriber, Transcription};
use crate::vision::{BoundingBox, Descriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentPhase {
    Unknown,
    Capturing,
    Listening,
    Resolved,
    Enrolled,
    Abandoned,
}

impl EnrollmentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Enrolled | Self::Abandoned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    CaptureFailed(String),
    RecordingFailed(String),
    /// Transcriber produced no text
    Ambiguous,
    /// Transcriber unreachable or failed
    Unavailable(String),
    /// Transcript did not yield a usable label
    InvalidLabel(String),
    DuplicateLabel(String),
    Gallery(String),
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CaptureFailed(e) => write!(f, "capture failed: {}", e),
            Self::RecordingFailed(e) => write!(f, "recording failed: {}", e),
            Self::Ambiguous => write!(f, "no name understood"),
            Self::Unavailable(e) => write!(f, "transcription unavailable: {}", e),
            Self::InvalidLabel(text) => write!(f, "'{}' is not a usable name", text),
            Self::DuplicateLabel(label) => write!(f, "'{}' is already enrolled", label),
            Self::Gallery(e) => write!(f, "gallery error: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    Enrolled {
        label: String,
        reference_image: PathBuf,
    },
    Abandoned(AbandonReason),
}

/// An unknown face handed over by recognition
#[derive(Debug, Clone)]
pub struct EnrollmentCandidate {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
    pub face: RgbImage,
}

/// Transient state of one enrollment attempt
pub struct EnrollmentSession {
    id: u64,
    phase: EnrollmentPhase,
    candidate: EnrollmentCandidate,
    capture_path: Option<PathBuf>,
    transcript: Option<String>,
}

impl EnrollmentSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> EnrollmentPhase {
        self.phase
    }

    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    fn advance(&mut self, next: EnrollmentPhase) {
        log::debug!("Enrollment #{}: {:?} -> {:?}", self.id, self.phase, next);
        self.phase = next;
    }

    fn abandon(&mut self, reason: AbandonReason) -> EnrollmentOutcome {
        log::warn!("Enrollment #{} abandoned: {}", self.id, reason);
        self.advance(EnrollmentPhase::Abandoned);
        EnrollmentOutcome::Abandoned(reason)
    }

    /// Remove the temporary capture
    fn discard(&mut self) {
        if let Some(path) = self.capture_path.take() {
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("Failed to remove capture {}: {}", path.display(), e);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentReport {
    pub session_id: u64,
    pub outcome: EnrollmentOutcome,
}

/// Runs enrollment sessions against the shared gallery
pub struct EnrollmentFlow {
    gallery: Arc<Gallery>,
    recorder: Arc<dyn AudioRecorder>,
    transcriber: Arc<dyn Transcriber>,
    record_duration: Duration,
    capture_dir: PathBuf,
    archive: Option<Arc<FaceArchive>>,
    next_id: AtomicU64,
}

impl EnrollmentFlow {
    pub fn new(
        gallery: Arc<Gallery>,
        recorder: Arc<dyn AudioRecorder>,
        transcriber: Arc<dyn Transcriber>,
        record_duration: Duration,
        capture_dir: PathBuf,
    ) -> Self {
        Self {
            gallery,
            recorder,
            transcriber,
            record_duration,
            capture_dir,
            archive: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Also archive enrolled reference crops
    pub fn with_archive(mut self, archive: Arc<FaceArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn begin(&self, candidate: EnrollmentCandidate) -> EnrollmentSession {
        EnrollmentSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            phase: EnrollmentPhase::Unknown,
            candidate,
            capture_path: None,
            transcript: None,
        }
    }

    /// Run one session to a terminal phase; blocks for the recording
    pub fn run(&self, candidate: EnrollmentCandidate) -> EnrollmentReport {
        let mut session = self.begin(candidate);
        log::info!(
            "Enrollment #{} started for unknown face at {}",
            session.id,
            session.candidate.bbox
        );

        let outcome = self.drive(&mut session);
        session.discard();

        EnrollmentReport {
            session_id: session.id,
            outcome,
        }
    }

    fn drive(&self, session: &mut EnrollmentSession) -> EnrollmentOutcome {
        session.advance(EnrollmentPhase::Capturing);
        let capture_path = match self.capture(session) {
            Ok(path) => path,
            Err(e) => return session.abandon(AbandonReason::CaptureFailed(format!("{:#}", e))),
        };

        session.advance(EnrollmentPhase::Listening);
        let clip = match self.recorder.record(self.record_duration) {
            Ok(clip) => clip,
            Err(e) => return session.abandon(AbandonReason::RecordingFailed(format!("{:#}", e))),
        };
        let text = match self.transcriber.transcribe(&clip) {
            Transcription::Text(text) => text,
            Transcription::Ambiguous => return session.abandon(AbandonReason::Ambiguous),
            Transcription::Unavailable(e) => {
                return session.abandon(AbandonReason::Unavailable(e))
            }
        };
        log::info!("Enrollment #{} heard: {:?}", session.id, text);
        session.transcript = Some(text.clone());

        session.advance(EnrollmentPhase::Resolved);
        let Some(label) = normalize_label(&text) else {
            return session.abandon(AbandonReason::InvalidLabel(text));
        };

        let reference = match image::open(&capture_path) {
            Ok(image) => image.to_rgb8(),
            Err(e) => return session.abandon(AbandonReason::CaptureFailed(e.to_string())),
        };

        let descriptor = session.candidate.descriptor.clone();
        let reference_image = match self.gallery.add(&label, descriptor, &reference) {
            Ok(path) => path,
            Err(GalleryError::DuplicateLabel(label)) => {
                return session.abandon(AbandonReason::DuplicateLabel(label))
            }
            Err(GalleryError::InvalidLabel(e)) => {
                return session.abandon(AbandonReason::InvalidLabel(e.to_string()))
            }
            Err(e) => return session.abandon(AbandonReason::Gallery(e.to_string())),
        };

        session.advance(EnrollmentPhase::Enrolled);
        log::info!("✓ Enrollment #{} enrolled '{}'", session.id, label);

        if let Some(archive) = &self.archive {
            if let Err(e) = archive.store(&label, None, std::slice::from_ref(&reference)) {
                log::warn!("Failed to archive reference for '{}': {:#}", label, e);
            }
        }

        EnrollmentOutcome::Enrolled {
            label,
            reference_image,
        }
    }

    /// Persist the candidate face to the temporary capture area
    fn capture(&self, session: &mut EnrollmentSession) -> Result<PathBuf> {
        fs::create_dir_all(&self.capture_dir)?;
        let path = self.capture_dir.join(format!("session_{}.png", session.id));
        session
            .candidate
            .face
            .save_with_format(&path, ImageFormat::Png)?;
        session.capture_path = Some(path.clone());
        Ok(path)
    }
}

/// Fixed pool of enrollment workers with a bounded backlog
pub struct EnrollmentPool {
    job_tx: Option<Sender<EnrollmentCandidate>>,
    handles: Vec<JoinHandle<()>>,
}

impl EnrollmentPool {
    pub fn start(
        flow: Arc<EnrollmentFlow>,
        workers: usize,
        queue_depth: usize,
        report_tx: Sender<EnrollmentReport>,
    ) -> Result<Self> {
        let (job_tx, job_rx) = bounded::<EnrollmentCandidate>(queue_depth);
        let mut handles = Vec::with_capacity(workers);

        for i in 0..workers.max(1) {
            let flow = Arc::clone(&flow);
            let job_rx = job_rx.clone();
            let report_tx = report_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("enrollment-{}", i))
                .spawn(move || run_enrollment_worker(flow, job_rx, report_tx))?;
            handles.push(handle);
        }

        log::info!(
            "Enrollment pool started ({} workers, queue depth {})",
            handles.len(),
            queue_depth
        );
        Ok(Self {
            job_tx: Some(job_tx),
            handles,
        })
    }

    /// Queue a candidate if there is room; returns false when it was dropped
    pub fn submit(&self, candidate: EnrollmentCandidate) -> bool {
        let Some(job_tx) = &self.job_tx else {
            return false;
        };
        match job_tx.try_send(candidate) {
            Ok(()) => true,
            Err(TrySendError::Full(c)) => {
                log::debug!("Enrollment busy, dropping unknown face at {}", c.bbox);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Queue a candidate, waiting for room
    pub fn submit_blocking(&self, candidate: EnrollmentCandidate) -> bool {
        match &self.job_tx {
            Some(job_tx) => job_tx.send(candidate).is_ok(),
            None => false,
        }
    }

    /// Finish queued sessions and join the workers
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Enrollment worker panicked");
            }
        }
    }
}

impl Drop for EnrollmentPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_enrollment_worker(
    flow: Arc<EnrollmentFlow>,
    job_rx: Receiver<EnrollmentCandidate>,
    report_tx: Sender<EnrollmentReport>,
) {
    while let Ok(candidate) = job_rx.recv() {
        let report = flow.run(candidate);
        // Reports are informational; keep working if nobody listens
        let _ = report_tx.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::recorder::AudioClip;
    use crossbeam_channel::unbounded;
    use image::Rgb;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FakeRecorder {
        fail: bool,
    }

    impl AudioRecorder for FakeRecorder {
        fn record(&self, _duration: Duration) -> Result<AudioClip> {
            if self.fail {
                anyhow::bail!("No microphone found");
            }
            Ok(AudioClip::new(vec![0; 1600], 16000))
        }
    }

    struct FakeTranscriber {
        result: Transcription,
        calls: AtomicUsize,
        /// Signalled when a transcription starts
        started: Option<Sender<()>>,
        /// Transcription waits for a message here
        gate: Option<Mutex<Receiver<()>>>,
    }

    impl FakeTranscriber {
        fn new(result: Transcription) -> Self {
            Self {
                result,
                calls: AtomicUsize::new(0),
                started: None,
                gate: None,
            }
        }
    }

    impl Transcriber for FakeTranscriber {
        fn transcribe(&self, _clip: &AudioClip) -> Transcription {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(started) = &self.started {
                let _ = started.send(());
            }
            if let Some(gate) = &self.gate {
                let _ = gate.lock().unwrap().recv();
            }
            self.result.clone()
        }
    }

    fn candidate(shade: u8) -> EnrollmentCandidate {
        EnrollmentCandidate {
            bbox: BoundingBox::new(0, 0, 6, 6),
            descriptor: Descriptor::new(vec![shade as f32 / 255.0, 0.5]).unwrap(),
            face: RgbImage::from_pixel(6, 6, Rgb([shade, shade, shade])),
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        gallery: Arc<Gallery>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let gallery = Arc::new(Gallery::open(&dir.path().join("gallery"), 0.6, false).unwrap());
            Self { dir, gallery }
        }

        fn capture_dir(&self) -> PathBuf {
            self.dir.path().join("tmp_capture")
        }

        fn flow(&self, recorder: FakeRecorder, transcriber: Arc<FakeTranscriber>) -> EnrollmentFlow {
            EnrollmentFlow::new(
                Arc::clone(&self.gallery),
                Arc::new(recorder),
                transcriber,
                Duration::from_millis(100),
                self.capture_dir(),
            )
        }
    }

    fn text(s: &str) -> Arc<FakeTranscriber> {
        Arc::new(FakeTranscriber::new(Transcription::Text(s.to_string())))
    }

    #[test]
    fn test_enrolls_transcribed_name() {
        let fx = Fixture::new();
        let flow = fx.flow(FakeRecorder { fail: false }, text("Alice"));

        let report = flow.run(candidate(200));
        match &report.outcome {
            EnrollmentOutcome::Enrolled { label, reference_image } => {
                assert_eq!(label, "alice");
                assert!(reference_image.exists());
            }
            other => panic!("expected Enrolled, got {:?}", other),
        }

        assert_eq!(fx.gallery.size(), 1);
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(fx.gallery.record_path()).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"alice": "faces/alice.png"}));

        // Temporary capture is gone
        assert_eq!(fs::read_dir(fx.capture_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_unavailable_transcriber_abandons() {
        let fx = Fixture::new();
        let transcriber = Arc::new(FakeTranscriber::new(Transcription::Unavailable(
            "connection refused".to_string(),
        )));
        let flow = fx.flow(FakeRecorder { fail: false }, transcriber);

        let report = flow.run(candidate(200));
        assert_eq!(
            report.outcome,
            EnrollmentOutcome::Abandoned(AbandonReason::Unavailable(
                "connection refused".to_string()
            ))
        );
        assert_eq!(fx.gallery.size(), 0);
        assert!(!fx.gallery.record_path().exists());
        assert_eq!(fs::read_dir(fx.capture_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_ambiguous_and_unusable_text_abandon() {
        let fx = Fixture::new();

        let flow = fx.flow(
            FakeRecorder { fail: false },
            Arc::new(FakeTranscriber::new(Transcription::Ambiguous)),
        );
        assert_eq!(
            flow.run(candidate(10)).outcome,
            EnrollmentOutcome::Abandoned(AbandonReason::Ambiguous)
        );

        let flow = fx.flow(FakeRecorder { fail: false }, text("?!"));
        assert!(matches!(
            flow.run(candidate(10)).outcome,
            EnrollmentOutcome::Abandoned(AbandonReason::InvalidLabel(_))
        ));
        assert_eq!(fx.gallery.size(), 0);
    }

    #[test]
    fn test_recording_failure_skips_transcription() {
        let fx = Fixture::new();
        let transcriber = text("alice");
        let flow = fx.flow(FakeRecorder { fail: true }, Arc::clone(&transcriber));

        assert!(matches!(
            flow.run(candidate(10)).outcome,
            EnrollmentOutcome::Abandoned(AbandonReason::RecordingFailed(_))
        ));
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_repeat_name_is_duplicate() {
        let fx = Fixture::new();
        let flow = fx.flow(FakeRecorder { fail: false }, text("My name is Alice"));

        assert!(matches!(
            flow.run(candidate(200)).outcome,
            EnrollmentOutcome::Enrolled { .. }
        ));
        assert_eq!(
            flow.run(candidate(40)).outcome,
            EnrollmentOutcome::Abandoned(AbandonReason::DuplicateLabel("alice".to_string()))
        );
        assert_eq!(fx.gallery.size(), 1);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let fx = Fixture::new();
        let flow = fx.flow(FakeRecorder { fail: false }, text("bob"));
        let a = flow.begin(candidate(1));
        let b = flow.begin(candidate(2));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.phase(), EnrollmentPhase::Unknown);
        assert!(!a.phase().is_terminal());
    }

    #[test]
    fn test_archives_enrolled_reference() {
        let fx = Fixture::new();
        let archive = Arc::new(FaceArchive::new(fx.dir.path().join("archive")));
        let flow = fx
            .flow(FakeRecorder { fail: false }, text("carol"))
            .with_archive(Arc::clone(&archive));

        flow.run(candidate(90));
        assert_eq!(archive.list_cropped("carol").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_sessions_same_name() {
        let fx = Fixture::new();
        let flow = Arc::new(fx.flow(FakeRecorder { fail: false }, text("alice")));
        let (report_tx, report_rx) = unbounded();

        let pool = EnrollmentPool::start(flow, 2, 2, report_tx).unwrap();
        assert!(pool.submit_blocking(candidate(100)));
        assert!(pool.submit_blocking(candidate(150)));
        pool.shutdown();

        let reports: Vec<_> = report_rx.try_iter().collect();
        assert_eq!(reports.len(), 2);
        let enrolled = reports
            .iter()
            .filter(|r| matches!(r.outcome, EnrollmentOutcome::Enrolled { .. }))
            .count();
        let duplicates = reports
            .iter()
            .filter(|r| r.outcome == EnrollmentOutcome::Abandoned(AbandonReason::DuplicateLabel("alice".to_string())))
            .count();
        assert_eq!((enrolled, duplicates), (1, 1));
        assert_eq!(fx.gallery.size(), 1);
    }

    #[test]
    fn test_pool_drops_candidates_when_full() {
        let fx = Fixture::new();
        let (started_tx, started_rx) = unbounded();
        let (gate_tx, gate_rx) = unbounded();
        let transcriber = Arc::new(FakeTranscriber {
            result: Transcription::Ambiguous,
            calls: AtomicUsize::new(0),
            started: Some(started_tx),
            gate: Some(Mutex::new(gate_rx)),
        });
        let flow = Arc::new(fx.flow(FakeRecorder { fail: false }, Arc::clone(&transcriber)));
        let (report_tx, report_rx) = unbounded();
        let pool = EnrollmentPool::start(flow, 1, 1, report_tx).unwrap();

        assert!(pool.submit(candidate(1)));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Worker busy: one candidate waits, the next is dropped
        assert!(pool.submit(candidate(2)));
        assert!(!pool.submit(candidate(3)));

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        pool.shutdown();

        assert_eq!(report_rx.try_iter().count(), 2);
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 2);
    }
}
