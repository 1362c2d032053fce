//! Frame sources backed by image files

use super::{Frame, FrameSource};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Replays a directory of still images as a frame stream, in file-name order
pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();

        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory: {}", dir.display()))?
        {
            let path = entry.context("Failed to read directory entry")?.path();
            if is_image_file(&path) {
                files.push(path);
            }
        }

        files.sort();
        log::info!("Frame source: {} images in {}", files.len(), dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };

        let image = image::open(path)
            .with_context(|| format!("Failed to decode frame: {}", path.display()))?
            .to_rgb8();
        let frame = Frame::new(self.next as u64, image);
        self.next += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("image directory {} ({} frames)", self.dir.display(), self.files.len())
    }
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
}
