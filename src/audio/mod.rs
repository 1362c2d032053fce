//! Microphone capture for enrollment recordings
//!
//! Capture is confined to the thread that creates it (cpal streams are not
//! Send); callers open an `AudioCapture` on their worker thread, pull
//! frames until they have enough, and drop it.

pub mod recorder;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Target sample rate for all audio processing (16 kHz)
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Target number of channels for processing (always mono)
pub const TARGET_CHANNELS: usize = 1;

/// Device information for enumeration
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub host: String,
    pub max_channels: u16,
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate_hz: u32,
    pub frame_ms: u32,
    /// Preferred input device; falls back to the system default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: TARGET_SAMPLE_RATE,
            frame_ms: 20,
            device_name: None,
        }
    }
}

impl AudioConfig {
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate_hz * self.frame_ms / 1000) as usize
    }
}

/// Map common CPAL errors to a short hint for the log
pub fn friendly_audio_error(error: &anyhow::Error) -> &'static str {
    let error_lower = format!("{:#}", error).to_lowercase();

    if error_lower.contains("device busy") || error_lower.contains("in use") {
        "Another app is using this microphone"
    } else if error_lower.contains("no such device")
        || error_lower.contains("not found")
        || error_lower.contains("disconnected")
    {
        "Microphone was unplugged or is no longer available"
    } else if error_lower.contains("permission") || error_lower.contains("denied") {
        "Permission denied; check the system microphone settings"
    } else if error_lower.contains("no input device") || error_lower.contains("no default") {
        "No microphone found"
    } else {
        "Audio system error"
    }
}

/// List all available input devices
pub fn list_input_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let host_name = host.id().name();

    let mut devices = Vec::new();
    for device in host.input_devices()? {
        let Ok(name) = device.name() else {
            continue;
        };
        let max_channels = device
            .supported_input_configs()
            .ok()
            .and_then(|mut configs| configs.next())
            .map(|config| config.channels())
            .unwrap_or(1);

        devices.push(DeviceInfo {
            is_default: Some(&name) == default_name.as_ref(),
            name,
            host: host_name.to_string(),
            max_channels,
        });
    }

    Ok(devices)
}

/// Resolve the preferred input device by name, or the system default
fn resolve_input_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if let Some(wanted) = name {
        if let Ok(mut devices) = host.input_devices() {
            if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(wanted)) {
                log::info!("✓ Resolved input device by name: {}", wanted);
                return Ok(device);
            }
        }
        log::warn!("Input device '{}' not found, falling back to default", wanted);
    }

    host.default_input_device()
        .context("No input device available")
}

/// Trait for audio sources that can provide frames
///
/// Note: This trait does not require Send since audio sources are confined to a single worker thread
pub trait AudioSource {
    /// Next frame of mono i16 samples, `None` if not enough audio yet
    fn next_frame(&mut self) -> Option<Vec<i16>>;

    fn sample_rate(&self) -> u32;
}

/// Mono capture from a CPAL input device, resampled to the configured rate
pub struct AudioCapture {
    _stream: Stream,
    receiver: mpsc::UnboundedReceiver<Vec<i16>>,
    frame_size: usize,
    /// Rate of the samples in `buffer`
    sample_rate: u32,
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    buffer: Vec<i16>,
}

impl AudioCapture {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let device = resolve_input_device(config.device_name.as_deref())?;
        log::info!("Using audio device: {}", device.name()?);

        let supported = device
            .default_input_config()
            .context("Failed to get default input config")?;
        let device_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;

        let resampler = if device_rate != config.sample_rate_hz {
            log::info!(
                "Audio: device={}Hz, {}ch -> processing={}Hz, {}ch",
                device_rate,
                channels,
                config.sample_rate_hz,
                TARGET_CHANNELS
            );
            Some(FftFixedIn::<f32>::new(
                device_rate as usize,
                config.sample_rate_hz as usize,
                config.samples_per_frame(),
                2,
                TARGET_CHANNELS,
            )?)
        } else {
            None
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let stream_config = StreamConfig {
            channels: channels as u16,
            sample_rate: cpal::SampleRate(device_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let on_error = |err: cpal::StreamError| log::error!("Audio stream error: {}", err);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &_| {
                    let _ = sender.send(downmix(data, channels, |s| (s * i16::MAX as f32) as i32));
                },
                on_error,
                None,
            )?,
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &_| {
                    let _ = sender.send(downmix(data, channels, |s| s as i32));
                },
                on_error,
                None,
            )?,
            SampleFormat::U16 => device.build_input_stream(
                &stream_config,
                move |data: &[u16], _: &_| {
                    let _ = sender.send(downmix(data, channels, |s| s as i32 - 32768));
                },
                on_error,
                None,
            )?,
            other => anyhow::bail!("Unsupported sample format: {:?}", other),
        };

        stream.play()?;
        log::info!("Audio capture started");

        Ok(Self {
            _stream: stream,
            receiver,
            frame_size: config.samples_per_frame(),
            sample_rate: config.sample_rate_hz,
            resampler,
            pending: Vec::new(),
            buffer: Vec::new(),
        })
    }

    fn absorb(&mut self, chunk: Vec<i16>) {
        let Some(resampler) = self.resampler.as_mut() else {
            self.buffer.extend_from_slice(&chunk);
            return;
        };

        self.pending
            .extend(chunk.iter().map(|&s| s as f32 / i16::MAX as f32));

        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let input = vec![self.pending.drain(..needed).collect::<Vec<f32>>()];
            match resampler.process(&input, None) {
                Ok(output) => self.buffer.extend(output[0].iter().map(|&s| {
                    (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16
                })),
                Err(e) => log::error!("Resampling error: {}", e),
            }
        }
    }
}

impl AudioSource for AudioCapture {
    fn next_frame(&mut self) -> Option<Vec<i16>> {
        while let Ok(chunk) = self.receiver.try_recv() {
            self.absorb(chunk);
        }

        if self.buffer.len() >= self.frame_size {
            Some(self.buffer.drain(..self.frame_size).collect())
        } else {
            None
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Average interleaved channels into mono i16
fn downmix<T: Copy>(data: &[T], channels: usize, widen: impl Fn(T) -> i32) -> Vec<i16> {
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|chunk| {
            let sum: i32 = chunk.iter().map(|&s| widen(s)).sum();
            (sum / chunk.len() as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16
        })
        .collect()
}
