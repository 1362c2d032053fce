//! The capture -> detect -> recognize -> enroll control loop
//!
//! `MainLoop::run` owns the primary thread: it pulls frames, runs the
//! detector, offers each detection to the rate-limited recognizer, and
//! renders captions. Recognition outcomes and enrollment reports come
//! back over channels and are folded in at the top of each iteration.
//! Nothing blocking (embedding, recording, transcription) runs here.

pub mod overlay;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::enrollment::{EnrollmentCandidate, EnrollmentFlow, EnrollmentOutcome, EnrollmentPool, EnrollmentReport};
use crate::gallery::Gallery;
use crate::recognition::{Dispatch, RecognitionOutcome, RecognitionState, RecognitionWorker};
use crate::vision::{FaceDetector, FaceEmbedder, FrameSource};
use overlay::{LabelTracker, Overlay, OverlaySink};

/// Signal type for stopping the main loop
#[derive(Debug, Clone, Copy)]
pub struct StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Termination signal received
    Stopped,
    SourceExhausted,
}

/// Counters for one run of the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub frames: u64,
    pub detections: u64,
    pub dispatched: u64,
    /// Detections skipped by the recognition rate limit
    pub rate_limited: u64,
    pub recognized: u64,
    pub unknown: u64,
    pub failed: u64,
    /// Unknown faces not handed to enrollment (disabled, busy, or stopping)
    pub enrollment_skipped: u64,
    pub enrolled: u64,
    pub abandoned: u64,
    pub exit: ExitReason,
}

#[derive(Debug, Default)]
struct Counters {
    frames: u64,
    detections: u64,
    dispatched: u64,
    rate_limited: u64,
    recognized: u64,
    unknown: u64,
    failed: u64,
    enrollment_skipped: u64,
    enrolled: u64,
    abandoned: u64,
}

impl Counters {
    fn finish(self, exit: ExitReason) -> LoopSummary {
        LoopSummary {
            frames: self.frames,
            detections: self.detections,
            dispatched: self.dispatched,
            rate_limited: self.rate_limited,
            recognized: self.recognized,
            unknown: self.unknown,
            failed: self.failed,
            enrollment_skipped: self.enrollment_skipped,
            enrolled: self.enrolled,
            abandoned: self.abandoned,
            exit,
        }
    }
}

/// Enrollment wiring for the loop
pub struct EnrollmentSettings {
    pub flow: Arc<EnrollmentFlow>,
    pub workers: usize,
    pub queue_depth: usize,
}

/// How unknown outcomes are handed to enrollment while draining
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    /// Drop the candidate if the pool is busy
    TrySubmit,
    /// Wait for room (source exhausted, no more frames coming)
    Wait,
    /// Shutting down on request; start nothing new
    Discard,
}

pub struct MainLoop {
    gallery: Arc<Gallery>,
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    enrollment: Option<EnrollmentSettings>,
    state: Arc<RecognitionState>,
    frame_interval: Duration,
    label_ttl: Duration,
}

impl MainLoop {
    pub fn new(
        gallery: Arc<Gallery>,
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        recognition_interval: Duration,
    ) -> Self {
        Self {
            gallery,
            detector,
            embedder,
            enrollment: None,
            state: Arc::new(RecognitionState::new(recognition_interval)),
            frame_interval: Duration::from_millis(33),
            label_ttl: Duration::from_millis(1500),
        }
    }

    pub fn with_enrollment(mut self, settings: EnrollmentSettings) -> Self {
        self.enrollment = Some(settings);
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_label_ttl(mut self, ttl: Duration) -> Self {
        self.label_ttl = ttl;
        self
    }

    /// Run until the source is exhausted, fails, or a stop signal arrives
    ///
    /// Background work is always drained and the source released before
    /// returning; a source failure is returned as the error.
    pub fn run(
        &self,
        mut source: Box<dyn FrameSource>,
        sink: &mut dyn OverlaySink,
        stop_rx: &Receiver<StopSignal>,
    ) -> Result<LoopSummary> {
        self.state.reset();

        let (outcome_tx, outcome_rx) = unbounded();
        let recognizer = RecognitionWorker::start(
            Arc::clone(&self.gallery),
            Arc::clone(&self.embedder),
            Arc::clone(&self.state),
            outcome_tx,
        )?;

        let (report_tx, report_rx) = unbounded();
        let pool = match &self.enrollment {
            Some(settings) => Some(EnrollmentPool::start(
                Arc::clone(&settings.flow),
                settings.workers,
                settings.queue_depth,
                report_tx,
            )?),
            None => None,
        };

        let mut tracker = LabelTracker::new(self.label_ttl);
        let mut counters = Counters::default();

        log::info!(
            "Main loop started: {} ({} known identities)",
            source.describe(),
            self.gallery.size()
        );

        let result: Result<ExitReason> = loop {
            if stop_rx.try_recv().is_ok() {
                break Ok(ExitReason::Stopped);
            }

            drain_outcomes(&outcome_rx, &mut tracker, pool.as_ref(), Handoff::TrySubmit, &mut counters);
            drain_reports(&report_rx, &mut counters);

            let frame = match source.next_frame() {
                Ok(Some(frame)) => Arc::new(frame),
                Ok(None) => break Ok(ExitReason::SourceExhausted),
                Err(e) => break Err(e),
            };
            counters.frames += 1;

            let boxes = match self.detector.detect(&frame) {
                Ok(boxes) => boxes,
                Err(e) => {
                    log::warn!("Detection failed on frame {}: {:#}", frame.index(), e);
                    Vec::new()
                }
            };

            let mut overlays = Vec::with_capacity(boxes.len());
            let now = Instant::now();
            for bbox in boxes {
                if !bbox.fits_within(frame.width(), frame.height()) {
                    log::warn!("Ignoring malformed detection {} on frame {}", bbox, frame.index());
                    continue;
                }
                counters.detections += 1;

                match recognizer.dispatch(&frame, bbox) {
                    Dispatch::Dispatched => counters.dispatched += 1,
                    Dispatch::RateLimited | Dispatch::Busy => counters.rate_limited += 1,
                }

                overlays.push(Overlay {
                    bbox,
                    caption: tracker.caption_for(&bbox, now),
                });
            }
            sink.render(&frame, &overlays);

            match stop_rx.recv_timeout(self.frame_interval) {
                Ok(StopSignal) => break Ok(ExitReason::Stopped),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(self.frame_interval),
            }
        };

        match &result {
            Ok(exit) => log::info!("Main loop stopping: {:?}", exit),
            Err(e) => log::error!("Frame source failed: {:#}", e),
        }

        // Wait for the in-flight recognition, then settle its outcome
        recognizer.shutdown();
        let handoff = match result {
            Ok(ExitReason::SourceExhausted) => Handoff::Wait,
            _ => Handoff::Discard,
        };
        drain_outcomes(&outcome_rx, &mut tracker, pool.as_ref(), handoff, &mut counters);

        if let Some(pool) = pool {
            pool.shutdown();
        }
        drain_reports(&report_rx, &mut counters);

        drop(source);
        log::info!("✓ Frame source released");

        let summary = counters.finish(result?);
        log::info!(
            "Main loop finished: {} frames, {} recognized, {} unknown, {} enrolled",
            summary.frames,
            summary.recognized,
            summary.unknown,
            summary.enrolled
        );
        Ok(summary)
    }
}

fn drain_outcomes(
    outcome_rx: &Receiver<RecognitionOutcome>,
    tracker: &mut LabelTracker,
    pool: Option<&EnrollmentPool>,
    handoff: Handoff,
    counters: &mut Counters,
) {
    for outcome in outcome_rx.try_iter() {
        match outcome {
            RecognitionOutcome::Recognized {
                bbox,
                label,
                distance,
            } => {
                counters.recognized += 1;
                log::info!("recognized: {} (d={:.3})", label, distance);
                tracker.observe(bbox, label, distance, Instant::now());
            }
            RecognitionOutcome::Unknown {
                bbox,
                descriptor,
                face,
            } => {
                counters.unknown += 1;
                tracker.forget(&bbox);

                let candidate = EnrollmentCandidate {
                    bbox,
                    descriptor,
                    face,
                };
                let submitted = match (pool, handoff) {
                    (Some(pool), Handoff::TrySubmit) => pool.submit(candidate),
                    (Some(pool), Handoff::Wait) => pool.submit_blocking(candidate),
                    _ => false,
                };
                if !submitted {
                    counters.enrollment_skipped += 1;
                }
            }
            RecognitionOutcome::Failed { bbox, reason } => {
                counters.failed += 1;
                log::debug!("Recognition failed at {}: {}", bbox, reason);
            }
        }
    }
}

fn drain_reports(report_rx: &Receiver<EnrollmentReport>, counters: &mut Counters) {
    for report in report_rx.try_iter() {
        match report.outcome {
            EnrollmentOutcome::Enrolled { .. } => counters.enrolled += 1,
            EnrollmentOutcome::Abandoned(_) => counters.abandoned += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::recorder::{AudioClip, AudioRecorder};
    use crate::speech::{Transcriber, Transcription};
    use crate::vision::{BoundingBox, Descriptor, Frame};
    use crossbeam_channel::{bounded, Sender};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct VecSource {
        frames: Vec<Frame>,
        next: usize,
        fail_at: Option<usize>,
        stop_at: Option<(usize, Sender<StopSignal>)>,
        released: Arc<AtomicBool>,
    }

    impl VecSource {
        fn new(frames: Vec<Frame>) -> Self {
            Self {
                frames,
                next: 0,
                fail_at: None,
                stop_at: None,
                released: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.fail_at == Some(self.next) {
                anyhow::bail!("camera unplugged");
            }
            if let Some((at, tx)) = &self.stop_at {
                if *at == self.next {
                    let _ = tx.send(StopSignal);
                }
            }
            let frame = self.frames.get(self.next).cloned();
            self.next += 1;
            Ok(frame)
        }

        fn describe(&self) -> String {
            format!("{} test frames", self.frames.len())
        }
    }

    impl Drop for VecSource {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// One face covering the center of every frame
    struct CenterDetector;

    impl FaceDetector for CenterDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>> {
            Ok(vec![BoundingBox::new(2, 2, frame.width() - 2, frame.height() - 2)])
        }
    }

    struct BrokenDetector;

    impl FaceDetector for BrokenDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<BoundingBox>> {
            anyhow::bail!("detector crashed")
        }
    }

    /// Mean colour of the face
    struct ColorEmbedder;

    impl FaceEmbedder for ColorEmbedder {
        fn dim(&self) -> usize {
            3
        }

        fn embed(&self, frame: &Frame, bbox: &BoundingBox) -> Result<Descriptor> {
            let crop = frame.crop(bbox)?;
            let n = crop.pixels().len() as f32;
            let mut sum = [0f32; 3];
            for p in crop.pixels() {
                for (s, v) in sum.iter_mut().zip(p.0) {
                    *s += v as f32 / 255.0;
                }
            }
            Descriptor::new(sum.iter().map(|s| s / n).collect())
        }
    }

    struct QuietRecorder;

    impl AudioRecorder for QuietRecorder {
        fn record(&self, _duration: Duration) -> Result<AudioClip> {
            Ok(AudioClip::new(vec![0; 160], 16000))
        }
    }

    struct FixedTranscriber(Transcription);

    impl Transcriber for FixedTranscriber {
        fn transcribe(&self, _clip: &AudioClip) -> Transcription {
            self.0.clone()
        }
    }

    fn frames(n: usize, color: [u8; 3]) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame::new(i as u64, RgbImage::from_pixel(16, 16, Rgb(color))))
            .collect()
    }

    #[derive(Default)]
    struct RecordingSink {
        rendered: Vec<(u64, Vec<Overlay>)>,
    }

    impl OverlaySink for RecordingSink {
        fn render(&mut self, frame: &Frame, overlays: &[Overlay]) {
            self.rendered.push((frame.index(), overlays.to_vec()));
        }
    }

    fn main_loop(gallery: &Arc<Gallery>, detector: Arc<dyn FaceDetector>) -> MainLoop {
        MainLoop::new(
            Arc::clone(gallery),
            detector,
            Arc::new(ColorEmbedder),
            Duration::from_secs(60),
        )
        .with_frame_interval(Duration::ZERO)
    }

    fn gallery(dir: &std::path::Path) -> Arc<Gallery> {
        Arc::new(Gallery::open(dir, 0.6, false).unwrap())
    }

    #[test]
    fn test_recognizes_known_face_once_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = gallery(dir.path());
        gallery
            .add("alice", Descriptor::new(vec![1.0, 0.0, 0.0]).unwrap(), &RgbImage::new(2, 2))
            .unwrap();

        let (_stop_tx, stop_rx) = bounded(1);
        let mut sink = RecordingSink::default();
        let summary = main_loop(&gallery, Arc::new(CenterDetector))
            .run(Box::new(VecSource::new(frames(4, [250, 5, 5]))), &mut sink, &stop_rx)
            .unwrap();

        assert_eq!(summary.exit, ExitReason::SourceExhausted);
        assert_eq!(summary.frames, 4);
        assert_eq!(summary.detections, 4);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.rate_limited, 3);
        assert_eq!(summary.recognized, 1);
        assert_eq!(summary.unknown, 0);

        assert_eq!(sink.rendered.len(), 4);
        assert!(sink.rendered.iter().all(|(_, overlays)| overlays.len() == 1));
    }

    #[test]
    fn test_unknown_face_is_enrolled_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = gallery(&dir.path().join("gallery"));
        let flow = EnrollmentFlow::new(
            Arc::clone(&gallery),
            Arc::new(QuietRecorder),
            Arc::new(FixedTranscriber(Transcription::Text("alice".into()))),
            Duration::from_millis(100),
            dir.path().join("tmp_capture"),
        );

        let (_stop_tx, stop_rx) = bounded(1);
        let summary = main_loop(&gallery, Arc::new(CenterDetector))
            .with_enrollment(EnrollmentSettings {
                flow: Arc::new(flow),
                workers: 1,
                queue_depth: 1,
            })
            .run(
                Box::new(VecSource::new(frames(2, [20, 200, 20]))),
                &mut RecordingSink::default(),
                &stop_rx,
            )
            .unwrap();

        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.enrolled, 1);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(gallery.labels(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_unavailable_transcription_leaves_gallery_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = gallery(&dir.path().join("gallery"));
        let flow = EnrollmentFlow::new(
            Arc::clone(&gallery),
            Arc::new(QuietRecorder),
            Arc::new(FixedTranscriber(Transcription::Unavailable("offline".into()))),
            Duration::from_millis(100),
            dir.path().join("tmp_capture"),
        );

        let (_stop_tx, stop_rx) = bounded(1);
        let summary = main_loop(&gallery, Arc::new(CenterDetector))
            .with_enrollment(EnrollmentSettings {
                flow: Arc::new(flow),
                workers: 1,
                queue_depth: 1,
            })
            .run(
                Box::new(VecSource::new(frames(1, [20, 200, 20]))),
                &mut RecordingSink::default(),
                &stop_rx,
            )
            .unwrap();

        assert_eq!(summary.abandoned, 1);
        assert_eq!(summary.enrolled, 0);
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_known_and_unknown_against_enrolled_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = gallery(&dir.path().join("gallery"));
        gallery
            .add("alice", Descriptor::new(vec![0.9, 0.0, 0.0]).unwrap(), &RgbImage::new(2, 2))
            .unwrap();

        // Red 153 embeds to (0.6, 0, 0): 0.3 from alice
        let near = frames(1, [153, 0, 0]);
        let bbox = CenterDetector.detect(&near[0]).unwrap()[0];
        match crate::recognition::recognize(&gallery, &ColorEmbedder, &near[0], bbox) {
            RecognitionOutcome::Recognized { label, distance, .. } => {
                assert_eq!(label, "alice");
                assert!((distance - 0.3).abs() < 1e-4, "distance {}", distance);
            }
            other => panic!("expected alice, got {:?}", other),
        }

        let (_stop_tx, stop_rx) = bounded(1);
        let summary = main_loop(&gallery, Arc::new(CenterDetector))
            .run(Box::new(VecSource::new(near)), &mut RecordingSink::default(), &stop_rx)
            .unwrap();
        assert_eq!(summary.recognized, 1);
        assert_eq!(summary.unknown, 0);

        // Black embeds to the origin: 0.9 from alice, so unknown; the
        // speech service is down and the session is abandoned
        let flow = EnrollmentFlow::new(
            Arc::clone(&gallery),
            Arc::new(QuietRecorder),
            Arc::new(FixedTranscriber(Transcription::Unavailable("offline".into()))),
            Duration::from_millis(100),
            dir.path().join("tmp_capture"),
        );
        let summary = main_loop(&gallery, Arc::new(CenterDetector))
            .with_enrollment(EnrollmentSettings {
                flow: Arc::new(flow),
                workers: 1,
                queue_depth: 1,
            })
            .run(
                Box::new(VecSource::new(frames(1, [0, 0, 0]))),
                &mut RecordingSink::default(),
                &stop_rx,
            )
            .unwrap();

        assert_eq!(summary.recognized, 0);
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.abandoned, 1);
        assert_eq!(summary.enrolled, 0);
        assert_eq!(gallery.size(), 1);
        assert_eq!(gallery.labels(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_stop_signal_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = gallery(dir.path());
        let (stop_tx, stop_rx) = bounded(1);

        let mut source = VecSource::new(frames(100, [0, 0, 0]));
        source.stop_at = Some((2, stop_tx));
        let released = Arc::clone(&source.released);

        let summary = main_loop(&gallery, Arc::new(CenterDetector))
            .run(Box::new(source), &mut RecordingSink::default(), &stop_rx)
            .unwrap();

        assert_eq!(summary.exit, ExitReason::Stopped);
        assert_eq!(summary.frames, 3);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_source_failure_is_reported_after_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = gallery(dir.path());
        let (_stop_tx, stop_rx) = bounded(1);

        let mut source = VecSource::new(frames(5, [0, 0, 0]));
        source.fail_at = Some(2);
        let released = Arc::clone(&source.released);

        let err = main_loop(&gallery, Arc::new(CenterDetector))
            .run(Box::new(source), &mut RecordingSink::default(), &stop_rx)
            .unwrap_err();

        assert!(err.to_string().contains("camera unplugged"));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_detector_errors_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = gallery(dir.path());
        let (_stop_tx, stop_rx) = bounded(1);
        let mut sink = RecordingSink::default();

        let summary = main_loop(&gallery, Arc::new(BrokenDetector))
            .run(Box::new(VecSource::new(frames(3, [9, 9, 9]))), &mut sink, &stop_rx)
            .unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.detections, 0);
        assert!(sink.rendered.iter().all(|(_, overlays)| overlays.is_empty()));
    }

    #[test]
    fn test_unknown_without_enrollment_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = gallery(dir.path());
        let (_stop_tx, stop_rx) = bounded(1);

        let summary = main_loop(&gallery, Arc::new(CenterDetector))
            .run(
                Box::new(VecSource::new(frames(1, [90, 90, 90]))),
                &mut RecordingSink::default(),
                &stop_rx,
            )
            .unwrap();

        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.enrollment_skipped, 1);
        assert!(gallery.is_empty());
    }
}
