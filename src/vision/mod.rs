//! Vision primitives and the collaborator seams around them
//!
//! Frames, bounding boxes, and descriptors are the only vision types the
//! recognition core understands. Face detection, embedding, and frame
//! acquisition are consumed through the `FaceDetector`, `FaceEmbedder`,
//! and `FrameSource` traits:
//! - Stub implementations (default): luminance heuristics for development
//! - ONNX embedder (`onnx` feature): ArcFace-style model via ONNX Runtime

pub mod source;
pub mod stub;

cfg_if::cfg_if! {
    if #[cfg(feature = "onnx")] {
        pub mod onnx;
    }
}

use anyhow::{bail, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{DetectorConfig, EmbedderBackend, EmbedderConfig};
use crate::paths::AppPaths;

/// Channel depth of every frame (packed RGB, 8 bits per channel)
pub const FRAME_CHANNELS: u8 = 3;

/// A single frame pulled from the source
///
/// Owned by the main loop for one iteration; shared read-only with the
/// recognition worker when a detection is dispatched.
#[derive(Debug, Clone)]
pub struct Frame {
    index: u64,
    image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self { index, image }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn channels(&self) -> u8 {
        FRAME_CHANNELS
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Box covering the whole frame
    pub fn full_box(&self) -> BoundingBox {
        BoundingBox::new(0, 0, self.width(), self.height())
    }

    /// Copy the pixels inside `bbox` out of the frame
    pub fn crop(&self, bbox: &BoundingBox) -> Result<RgbImage> {
        if !bbox.fits_within(self.width(), self.height()) {
            bail!(
                "Malformed detection box {} for {}x{} frame",
                bbox,
                self.width(),
                self.height()
            );
        }
        Ok(image::imageops::crop_imm(
            &self.image,
            bbox.x1,
            bbox.y1,
            bbox.width(),
            bbox.height(),
        )
        .to_image())
    }
}

/// Axis-aligned face box in pixel coordinates; `x2`/`y2` are exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Non-empty and entirely inside a `width`x`height` frame
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.area() > 0 && self.x2 <= width && self.y2 <= height
    }

    /// Intersection over union, 0.0 for disjoint boxes
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }

        let inter = (ix2 - ix1) as u64 * (iy2 - iy1) as u64;
        let union = self.area() + other.area() - inter;
        if union == 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})-({},{})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// Face descriptor produced by an embedder
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    /// Wrap raw embedder output; rejects empty or non-finite vectors
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            bail!("Descriptor cannot be empty");
        }
        if values.iter().any(|v| !v.is_finite()) {
            bail!("Descriptor contains non-finite values");
        }
        Ok(Self(values))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean distance; callers guarantee equal dimensions
    pub fn distance(&self, other: &Descriptor) -> f32 {
        debug_assert_eq!(self.dim(), other.dim());
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit length (zero vectors are left untouched)
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.0.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in self.0.iter_mut() {
                *x /= norm;
            }
        }
        self
    }
}

/// Finds faces in a frame
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>>;
}

/// Turns a detected face into a descriptor
pub trait FaceEmbedder: Send + Sync {
    /// Descriptor dimension, constant for the embedder's lifetime
    fn dim(&self) -> usize;

    fn embed(&self, frame: &Frame, bbox: &BoundingBox) -> Result<Descriptor>;
}

/// Trait for frame sources
///
/// Note: This trait does not require Send since sources are owned by the main loop thread
pub trait FrameSource {
    /// Next frame, `Ok(None)` once the source is exhausted
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Largest box by area (first wins on ties)
pub fn largest(boxes: &[BoundingBox]) -> Option<BoundingBox> {
    boxes.iter().fold(None, |best: Option<BoundingBox>, b| match best {
        Some(cur) if cur.area() >= b.area() => Some(cur),
        _ => Some(*b),
    })
}

/// Face box to embed for a stored reference image
///
/// Reference images are face crops, so when the detector finds nothing the
/// whole image is used.
pub fn reference_box(detector: &dyn FaceDetector, frame: &Frame) -> Result<BoundingBox> {
    let boxes = detector.detect(frame)?;
    Ok(largest(&boxes).unwrap_or_else(|| frame.full_box()))
}

/// Build the configured face detector
pub fn build_detector(config: &DetectorConfig) -> Arc<dyn FaceDetector> {
    Arc::new(stub::StubDetector::new(config.clone()))
}

/// Build the configured face embedder
pub fn build_embedder(config: &EmbedderConfig, paths: &AppPaths) -> Result<Arc<dyn FaceEmbedder>> {
    match config.backend {
        EmbedderBackend::Stub => {
            log::info!("Using stub embedder (grid={})", config.grid);
            Ok(Arc::new(stub::StubEmbedder::new(config.grid)))
        }
        EmbedderBackend::Onnx => {
            let model_path = config
                .model_path
                .clone()
                .unwrap_or_else(|| paths.embedder_model_file());
            build_onnx_embedder(model_path)
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "onnx")] {
        fn build_onnx_embedder(model_path: std::path::PathBuf) -> Result<Arc<dyn FaceEmbedder>> {
            Ok(Arc::new(onnx::OnnxEmbedder::new(&model_path)?))
        }
    } else {
        fn build_onnx_embedder(model_path: std::path::PathBuf) -> Result<Arc<dyn FaceEmbedder>> {
            bail!(
                "ONNX embedder ({}) requires the onnx feature. Build with --features onnx",
                model_path.display()
            )
        }
    }
}
