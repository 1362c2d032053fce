//! Application configuration (config.toml)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::audio::{AudioConfig, TARGET_SAMPLE_RATE};
use crate::validation::{
    self, validate_interval_ms, validate_match_threshold, validate_queue_depth,
    validate_record_ms, validate_sample_rate, validate_workers, ValidationError,
};

/// Default Euclidean match threshold
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config value for {field}: {source}")]
    Invalid {
        field: &'static str,
        source: ValidationError,
    },
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub gallery: GalleryConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Maximum Euclidean distance (exclusive) still considered a match
    pub match_threshold: f32,
    /// Minimum time between recognition attempts (process-wide)
    pub interval_ms: u64,
    /// How long a recognized caption sticks to an overlapping box
    pub label_ttl_ms: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            interval_ms: 1000,
            label_ttl_ms: 1500,
        }
    }
}

impl RecognitionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn label_ttl(&self) -> Duration {
        Duration::from_millis(self.label_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentConfig {
    pub enabled: bool,
    /// Length of the spoken-name recording
    pub record_ms: u64,
    /// Enrollment worker threads
    pub workers: usize,
    /// Unknown faces allowed to wait for a free worker; extra ones are dropped
    pub queue_depth: usize,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            record_ms: 3000,
            workers: 1,
            queue_depth: 1,
        }
    }
}

impl EnrollmentConfig {
    pub fn record_duration(&self) -> Duration {
        Duration::from_millis(self.record_ms)
    }
}

/// External speech-to-text command
///
/// `{wav}` in `args` is replaced by the path of the recorded clip. With no
/// `program` configured, enrollment cannot resolve names and stays off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["{wav}".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Pause between frames; also the termination-signal poll interval
    pub frame_interval_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 33,
        }
    }
}

impl SourceConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Pixels at or above this luma count as face
    pub luma_threshold: u8,
    /// Smallest accepted face edge in pixels
    pub min_face_px: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            luma_threshold: 48,
            min_face_px: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderBackend {
    Stub,
    Onnx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    pub backend: EmbedderBackend,
    /// Stub embedder patch size (descriptor dim = grid * grid)
    pub grid: u32,
    /// ONNX model path (defaults to models/face/arcface-112.onnx)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            backend: EmbedderBackend::Stub,
            grid: 8,
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryConfig {
    /// Keep encrypted descriptors next to reference images
    pub cache_descriptors: bool,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            cache_descriptors: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Copy enrolled reference crops into the face archive
    pub enabled: bool,
}

impl AppConfig {
    /// Load config from file or create default
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: AppConfig = toml::from_str(&content)?;
            config.validate()?;
            log::info!("Config loaded from: {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let toml_str = toml::to_string_pretty(&config)?;
            fs::write(path, toml_str)?;
            log::info!("Default config created at: {}", path.display());
            Ok(config)
        }
    }

    /// Reject values the runtime cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn field<T>(
            field: &'static str,
            result: Result<T, ValidationError>,
        ) -> Result<(), ConfigError> {
            result
                .map(|_| ())
                .map_err(|source| ConfigError::Invalid { field, source })
        }

        field(
            "recognition.match_threshold",
            validate_match_threshold(self.recognition.match_threshold),
        )?;
        field(
            "recognition.interval_ms",
            validate_interval_ms(self.recognition.interval_ms),
        )?;
        field(
            "enrollment.record_ms",
            validate_record_ms(self.enrollment.record_ms),
        )?;
        field(
            "enrollment.workers",
            validate_workers(self.enrollment.workers),
        )?;
        field(
            "enrollment.queue_depth",
            validate_queue_depth(self.enrollment.queue_depth),
        )?;
        field(
            "audio.sample_rate_hz",
            validate_sample_rate(self.audio.sample_rate_hz, TARGET_SAMPLE_RATE),
        )?;
        field(
            "audio.device_name",
            validation::validate_opt_device_name(&self.audio.device_name),
        )?;
        Ok(())
    }
}
