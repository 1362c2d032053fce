//! Local face archive
//!
//! Stores an original image and the faces cropped from it under a caller
//! supplied identifier:
//!
//! ```text
//! users/<id>/images/original_<stamp>.png
//! users/<id>/cropped_images/cropped_<i>_<stamp>.png
//! ```
//!
//! Write-only from the recognizer's point of view: nothing here is read
//! back into gallery matching.

use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::validation::validate_identifier;

const USERS_DIR: &str = "users";
const IMAGES_DIR: &str = "images";
const CROPPED_DIR: &str = "cropped_images";

/// Paths written by one `store` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReceipt {
    pub original: Option<PathBuf>,
    pub cropped: Vec<PathBuf>,
}

pub struct FaceArchive {
    root: PathBuf,
    sequence: AtomicU64,
}

impl FaceArchive {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, identifier: &str) -> Result<PathBuf> {
        validate_identifier(identifier)?;
        Ok(self.root.join(USERS_DIR).join(identifier))
    }

    /// Millisecond timestamp plus a per-process sequence number
    fn stamp(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}_{:04}", chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"), n)
    }

    pub fn store(
        &self,
        identifier: &str,
        original: Option<&RgbImage>,
        faces: &[RgbImage],
    ) -> Result<ArchiveReceipt> {
        let user_dir = self.user_dir(identifier)?;
        let stamp = self.stamp();
        let mut receipt = ArchiveReceipt::default();

        if let Some(image) = original {
            let dir = user_dir.join(IMAGES_DIR);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let path = dir.join(format!("original_{}.png", stamp));
            image
                .save_with_format(&path, ImageFormat::Png)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            receipt.original = Some(path);
        }

        if !faces.is_empty() {
            let dir = user_dir.join(CROPPED_DIR);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            for (i, face) in faces.iter().enumerate() {
                let path = dir.join(format!("cropped_{}_{}.png", i, stamp));
                face.save_with_format(&path, ImageFormat::Png)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                receipt.cropped.push(path);
            }
        }

        log::info!(
            "Archived {} original and {} cropped images for '{}'",
            receipt.original.iter().count(),
            receipt.cropped.len(),
            identifier
        );
        Ok(receipt)
    }

    pub fn list_images(&self, identifier: &str) -> Result<Vec<PathBuf>> {
        list_png(&self.user_dir(identifier)?.join(IMAGES_DIR))
    }

    pub fn list_cropped(&self, identifier: &str) -> Result<Vec<PathBuf>> {
        list_png(&self.user_dir(identifier)?.join(CROPPED_DIR))
    }
}

fn list_png(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("png") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
