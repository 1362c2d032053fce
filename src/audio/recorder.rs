//! Fixed-duration recordings for spoken-name enrollment

use super::{AudioCapture, AudioConfig, AudioSource};
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};

/// Extra time allowed past the requested duration before giving up
const RECORD_GRACE: Duration = Duration::from_secs(2);

/// A mono 16-bit recording
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Write as 16-bit PCM mono WAV
    pub fn write_wav(&self, path: &Path) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize().context("Failed to finalize WAV file")?;
        Ok(())
    }
}

/// Blocking audio recording capability
///
/// Called from enrollment worker threads only; implementations may block
/// for the full duration.
pub trait AudioRecorder: Send + Sync {
    fn record(&self, duration: Duration) -> Result<AudioClip>;
}

/// Records from the configured microphone
pub struct MicRecorder {
    config: AudioConfig,
}

impl MicRecorder {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl AudioRecorder for MicRecorder {
    fn record(&self, duration: Duration) -> Result<AudioClip> {
        // Opened per recording so the stream lives on the calling worker thread
        let mut capture = AudioCapture::new(&self.config).map_err(|e| {
            log::error!("Microphone unavailable: {}", super::friendly_audio_error(&e));
            e
        })?;

        let sample_rate = capture.sample_rate();
        let wanted = (duration.as_secs_f64() * sample_rate as f64) as usize;
        let deadline = Instant::now() + duration + RECORD_GRACE;
        let mut samples = Vec::with_capacity(wanted);

        log::info!("Recording {}ms of audio...", duration.as_millis());

        while samples.len() < wanted {
            if let Some(frame) = capture.next_frame() {
                samples.extend(frame);
            } else if Instant::now() >= deadline {
                break;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        if samples.is_empty() {
            bail!("Microphone produced no audio");
        }

        samples.truncate(wanted);
        log::debug!("Recorded {} samples @{}Hz", samples.len(), sample_rate);
        Ok(AudioClip::new(samples, sample_rate))
    }
}
