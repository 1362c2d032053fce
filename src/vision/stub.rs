//! Stub vision collaborators for development without model files
//!
//! Provides a luminance-based face detector and a grid-luminance embedder.
//! Both are deterministic, which the gallery round-trip relies on.

use super::{BoundingBox, Descriptor, FaceDetector, FaceEmbedder, Frame};
use crate::config::DetectorConfig;
use anyhow::{Context, Result};
use image::imageops::{self, FilterType};

/// Treats the bounding box of all pixels brighter than the configured
/// threshold as one face (a lit face against a dark background)
pub struct StubDetector {
    config: DetectorConfig,
}

impl StubDetector {
    pub fn new(config: DetectorConfig) -> Self {
        log::info!(
            "Stub detector: luma_threshold={}, min_face_px={}",
            config.luma_threshold,
            config.min_face_px
        );
        Self { config }
    }
}

impl FaceDetector for StubDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>> {
        let mut bounds: Option<BoundingBox> = None;

        for (x, y, px) in frame.image().enumerate_pixels() {
            if luma(px.0) < self.config.luma_threshold {
                continue;
            }
            bounds = Some(match bounds {
                None => BoundingBox::new(x, y, x + 1, y + 1),
                Some(b) => BoundingBox::new(b.x1.min(x), b.y1.min(y), b.x2.max(x + 1), b.y2.max(y + 1)),
            });
        }

        Ok(bounds
            .filter(|b| b.width() >= self.config.min_face_px && b.height() >= self.config.min_face_px)
            .into_iter()
            .collect())
    }
}

/// Downsamples the face crop to a `grid`x`grid` grayscale patch and uses
/// the normalized intensities as the descriptor
pub struct StubEmbedder {
    grid: u32,
}

impl StubEmbedder {
    pub fn new(grid: u32) -> Self {
        Self { grid: grid.max(1) }
    }
}

impl FaceEmbedder for StubEmbedder {
    fn dim(&self) -> usize {
        (self.grid * self.grid) as usize
    }

    fn embed(&self, frame: &Frame, bbox: &BoundingBox) -> Result<Descriptor> {
        let crop = frame.crop(bbox)?;
        let gray = imageops::grayscale(&crop);
        let patch = imageops::resize(&gray, self.grid, self.grid, FilterType::Triangle);

        let values: Vec<f32> = patch.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        Descriptor::new(values).context("Stub embedder produced an invalid descriptor")
    }
}

/// ITU-R BT.601 luma approximation
fn luma(rgb: [u8; 3]) -> u8 {
    ((rgb[0] as u32 * 299 + rgb[1] as u32 * 587 + rgb[2] as u32 * 114) / 1000) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frame_with_square(x: u32, y: u32, size: u32) -> Frame {
        let mut img = RgbImage::new(64, 64);
        for py in y..y + size {
            for px in x..x + size {
                img.put_pixel(px, py, Rgb([220, 200, 180]));
            }
        }
        Frame::new(0, img)
    }

    #[test]
    fn test_detects_bright_region() {
        let detector = StubDetector::new(DetectorConfig::default());
        let boxes = detector.detect(&frame_with_square(10, 12, 20)).unwrap();
        assert_eq!(boxes, vec![BoundingBox::new(10, 12, 30, 32)]);
    }

    #[test]
    fn test_dark_frame_has_no_faces() {
        let detector = StubDetector::new(DetectorConfig::default());
        let boxes = detector.detect(&Frame::new(0, RgbImage::new(32, 32))).unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn test_tiny_region_ignored() {
        let detector = StubDetector::new(DetectorConfig::default());
        let boxes = detector.detect(&frame_with_square(5, 5, 2)).unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn test_embedding_is_deterministic() {
        let embedder = StubEmbedder::new(4);
        let frame = frame_with_square(10, 10, 20);
        let bbox = BoundingBox::new(8, 8, 34, 34);

        let a = embedder.embed(&frame, &bbox).unwrap();
        let b = embedder.embed(&frame, &bbox).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), 16);
    }

    #[test]
    fn test_embedding_matches_on_crop() {
        let embedder = StubEmbedder::new(8);
        let frame = frame_with_square(10, 10, 20);
        let bbox = BoundingBox::new(6, 6, 36, 36);

        let live = embedder.embed(&frame, &bbox).unwrap();
        let crop = Frame::new(1, frame.crop(&bbox).unwrap());
        let stored = embedder.embed(&crop, &crop.full_box()).unwrap();
        assert!(live.distance(&stored) < 1e-6);
    }

    #[test]
    fn test_malformed_box_fails() {
        let embedder = StubEmbedder::new(8);
        let frame = frame_with_square(10, 10, 20);
        assert!(embedder.embed(&frame, &BoundingBox::new(0, 0, 100, 100)).is_err());
    }
}
