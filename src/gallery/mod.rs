//! Identity gallery: known faces and the matching rule
//!
//! Layout inside the gallery directory:
//! - `gallery.json`: durable record, label -> reference image
//! - `faces/<label>.png`: reference images
//! - `descriptors/`, `.key`: optional encrypted descriptor cache
//!
//! All reads and writes go through one coarse lock, so `match_descriptor`
//! always sees a consistent identity list and `add` performs its
//! duplicate check, persistence, and append atomically.

pub mod cache;
pub mod record;

use image::{ImageFormat, RgbImage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::validation::{validate_label, ValidationError};
use crate::vision::{reference_box, Descriptor, FaceDetector, FaceEmbedder, Frame};
use cache::{compute_sha256, DescriptorCache};
use record::{GalleryRecord, RecordError};

pub const RECORD_FILE: &str = "gallery.json";
const FACES_DIR: &str = "faces";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("Label '{0}' is already enrolled")]
    DuplicateLabel(String),

    #[error("Label '{0}' is not enrolled")]
    UnknownLabel(String),

    #[error("Descriptor dimension {actual} does not match gallery dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid label: {0}")]
    InvalidLabel(#[from] ValidationError),

    #[error("Gallery I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to store reference image: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// A known person
#[derive(Debug, Clone)]
pub struct Identity {
    label: String,
    descriptors: Vec<Descriptor>,
    reference_image: PathBuf,
}

impl Identity {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn reference_image(&self) -> &Path {
        &self.reference_image
    }

    /// Smallest distance from `query` to any of this identity's descriptors
    fn distance(&self, query: &Descriptor) -> Option<f32> {
        self.descriptors
            .iter()
            .map(|d| d.distance(query))
            .fold(None, |best, d| match best {
                Some(b) if b <= d => Some(b),
                _ => Some(d),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: String,
    pub distance: f32,
}

/// What a rebuild managed to load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
    pub from_cache: usize,
}

struct GalleryInner {
    /// Everything persisted, including entries that failed to load
    record: GalleryRecord,
    /// Loaded identities, in record order
    identities: Vec<Identity>,
    dim: Option<usize>,
}

pub struct Gallery {
    dir: PathBuf,
    threshold: f32,
    cache: Option<DescriptorCache>,
    inner: Mutex<GalleryInner>,
}

impl Gallery {
    /// Open an empty gallery rooted at `dir`; call `rebuild` to load the record
    pub fn open(dir: &Path, threshold: f32, cache_descriptors: bool) -> Result<Self, GalleryError> {
        fs::create_dir_all(dir.join(FACES_DIR))?;

        let cache = if cache_descriptors {
            match DescriptorCache::open(dir) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    log::warn!("Descriptor cache disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            threshold,
            cache,
            inner: Mutex::new(GalleryInner {
                record: GalleryRecord::new(),
                identities: Vec::new(),
                dim: None,
            }),
        })
    }

    /// Open and rebuild in one step
    pub fn load(
        dir: &Path,
        threshold: f32,
        cache_descriptors: bool,
        detector: &dyn FaceDetector,
        embedder: &dyn FaceEmbedder,
    ) -> Result<(Self, LoadReport), GalleryError> {
        let gallery = Self::open(dir, threshold, cache_descriptors)?;
        let report = gallery.rebuild(detector, embedder);
        Ok((gallery, report))
    }

    fn lock(&self) -> MutexGuard<'_, GalleryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Re-read the durable record and recompute every descriptor
    ///
    /// Never fails: a missing or malformed record leaves the gallery empty,
    /// and identities whose reference image cannot be read or embedded are
    /// skipped (they stay in the record).
    pub fn rebuild(&self, detector: &dyn FaceDetector, embedder: &dyn FaceEmbedder) -> LoadReport {
        let mut inner = self.lock();
        let mut report = LoadReport::default();

        inner.record = self.read_record();
        inner.identities.clear();
        inner.dim = None;

        let dim = embedder.dim();
        let entries = inner.record.entries().to_vec();

        for entry in entries {
            let image_path = self.dir.join(&entry.image);
            if !image_path.exists() {
                log::warn!(
                    "Skipping '{}': reference image missing ({})",
                    entry.label,
                    image_path.display()
                );
                report.skipped += 1;
                continue;
            }

            match self.load_descriptor(&entry.label, &image_path, detector, embedder) {
                Ok((descriptor, cached)) if descriptor.dim() == dim => {
                    if cached {
                        report.from_cache += 1;
                    }
                    inner.identities.push(Identity {
                        label: entry.label,
                        descriptors: vec![descriptor],
                        reference_image: image_path,
                    });
                    inner.dim = Some(dim);
                    report.loaded += 1;
                }
                Ok((descriptor, _)) => {
                    log::warn!(
                        "Skipping '{}': descriptor dimension {} != {}",
                        entry.label,
                        descriptor.dim(),
                        dim
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    log::warn!("Skipping '{}': {:#}", entry.label, e);
                    report.skipped += 1;
                }
            }
        }

        log::info!(
            "✓ Gallery loaded: {} identities ({} from cache, {} skipped)",
            report.loaded,
            report.from_cache,
            report.skipped
        );
        report
    }

    fn read_record(&self) -> GalleryRecord {
        let path = self.record_path();
        match GalleryRecord::load(&path) {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::warn!("No gallery record at {}, starting empty", path.display());
                GalleryRecord::new()
            }
            Err(e) => {
                log::warn!("{}; starting with an empty gallery", e);
                // Keep the unreadable record for inspection instead of overwriting it
                let backup = path.with_extension("json.corrupt");
                if let Err(e) = fs::rename(&path, &backup) {
                    log::warn!("Failed to set aside corrupt record: {}", e);
                } else {
                    log::warn!("Corrupt record moved to {}", backup.display());
                }
                GalleryRecord::new()
            }
        }
    }

    /// Descriptor for a stored reference image, and whether it came from the cache
    fn load_descriptor(
        &self,
        label: &str,
        image_path: &Path,
        detector: &dyn FaceDetector,
        embedder: &dyn FaceEmbedder,
    ) -> anyhow::Result<(Descriptor, bool)> {
        let hash = match &self.cache {
            Some(cache) => {
                let hash = compute_sha256(image_path)?;
                if let Some(descriptor) = cache.load(label, &hash, embedder.dim()) {
                    return Ok((descriptor, true));
                }
                Some(hash)
            }
            None => None,
        };

        let image = image::open(image_path)?.to_rgb8();
        let frame = Frame::new(0, image);
        let bbox = reference_box(detector, &frame)?;
        let descriptor = embedder.embed(&frame, &bbox)?;

        if let (Some(cache), Some(hash)) = (&self.cache, hash) {
            if let Err(e) = cache.store(label, &descriptor, &hash) {
                log::warn!("Failed to cache descriptor for '{}': {:#}", label, e);
            }
        }

        Ok((descriptor, false))
    }

    /// Closest identity strictly within the threshold
    ///
    /// Ties go to the identity enrolled first.
    pub fn match_descriptor(&self, query: &Descriptor) -> Option<MatchResult> {
        let inner = self.lock();

        if inner.identities.is_empty() {
            return None;
        }
        if let Some(dim) = inner.dim {
            if dim != query.dim() {
                log::warn!(
                    "Query descriptor dimension {} != gallery dimension {}",
                    query.dim(),
                    dim
                );
                return None;
            }
        }

        let mut best: Option<(&Identity, f32)> = None;
        for identity in &inner.identities {
            let Some(distance) = identity.distance(query) else {
                continue;
            };
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((identity, distance)),
            }
        }

        let (identity, distance) = best?;
        log::trace!("Nearest identity '{}' at {:.4}", identity.label, distance);

        (distance < self.threshold).then(|| MatchResult {
            label: identity.label.clone(),
            distance,
        })
    }

    /// Enroll a new identity
    ///
    /// Persists the reference image and the record before returning the
    /// stored image path. Existing labels are rejected, never merged, and
    /// labels differing only in case count as existing.
    pub fn add(
        &self,
        label: &str,
        descriptor: Descriptor,
        face: &RgbImage,
    ) -> Result<PathBuf, GalleryError> {
        validate_label(label)?;
        let mut inner = self.lock();

        if let Some(existing) = inner.record.conflicting(label) {
            return Err(GalleryError::DuplicateLabel(existing.label.clone()));
        }
        if let Some(expected) = inner.dim {
            if expected != descriptor.dim() {
                return Err(GalleryError::DimensionMismatch {
                    expected,
                    actual: descriptor.dim(),
                });
            }
        }

        let relative = Path::new(FACES_DIR).join(format!("{}.png", label));
        let image_path = self.dir.join(&relative);
        let tmp = image_path.with_extension("png.tmp");
        face.save_with_format(&tmp, ImageFormat::Png)?;
        fs::rename(&tmp, &image_path)?;

        let mut updated = inner.record.clone();
        updated.insert(label, relative);
        if let Err(e) = updated.save(&self.record_path()) {
            let _ = fs::remove_file(&image_path);
            return Err(e.into());
        }
        inner.record = updated;

        if let Some(cache) = &self.cache {
            let stored = compute_sha256(&image_path)
                .and_then(|hash| cache.store(label, &descriptor, &hash));
            if let Err(e) = stored {
                log::warn!("Failed to cache descriptor for '{}': {:#}", label, e);
            }
        }

        inner.dim.get_or_insert(descriptor.dim());
        inner.identities.push(Identity {
            label: label.to_string(),
            descriptors: vec![descriptor],
            reference_image: image_path.clone(),
        });

        log::info!("✓ Enrolled '{}' ({} identities)", label, inner.identities.len());
        Ok(image_path)
    }

    /// Forget an identity: record entry, reference image, and cached descriptor
    pub fn remove(&self, label: &str) -> Result<(), GalleryError> {
        let mut inner = self.lock();

        let mut updated = inner.record.clone();
        let entry = updated
            .remove(label)
            .ok_or_else(|| GalleryError::UnknownLabel(label.to_string()))?;
        updated.save(&self.record_path())?;
        inner.record = updated;

        inner.identities.retain(|i| i.label != label);
        if inner.identities.is_empty() {
            inner.dim = None;
        }

        let image_path = self.dir.join(&entry.image);
        if let Err(e) = fs::remove_file(&image_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", image_path.display(), e);
            }
        }
        if let Some(cache) = &self.cache {
            cache.remove(label);
        }

        log::info!("Removed '{}' from gallery", label);
        Ok(())
    }

    /// Number of loaded identities
    pub fn size(&self) -> usize {
        self.lock().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Loaded labels, in enrollment order
    pub fn labels(&self) -> Vec<String> {
        self.lock()
            .identities
            .iter()
            .map(|i| i.label.clone())
            .collect()
    }

    pub fn identity(&self, label: &str) -> Option<Identity> {
        self.lock()
            .identities
            .iter()
            .find(|i| i.label == label)
            .cloned()
    }

    /// Descriptor dimension of the loaded identities
    pub fn dim(&self) -> Option<usize> {
        self.lock().dim
    }
}
