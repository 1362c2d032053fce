//! ArcFace-style face embedder on ONNX Runtime
//!
//! Expects a model taking `[1, 3, 112, 112]` RGB input normalized to
//! `(v - 127.5) / 128` and producing a single embedding row.

use super::{BoundingBox, Descriptor, FaceEmbedder, Frame};
use crate::gallery::cache::compute_sha256;
use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

const INPUT_SIZE: u32 = 112;

pub struct OnnxEmbedder {
    session: Mutex<Session>,
    dim: usize,
}

impl OnnxEmbedder {
    pub fn new(model_path: &Path) -> Result<Self> {
        log::info!("Loading face embedding model from: {}", model_path.display());

        if !model_path.exists() {
            bail!("Face embedding model not found: {}", model_path.display());
        }

        let hash = compute_sha256(model_path)?;
        log::debug!("{}: sha256 {}", model_path.display(), hash);

        let session = Session::builder()
            .context("Failed to create session builder")?
            .commit_from_file(model_path)
            .context("Failed to create embedding session")?;

        let mut embedder = Self {
            session: Mutex::new(session),
            dim: 0,
        };

        // Probe once so dim() is known before the first real face
        let probe = embedder.run(&RgbImage::new(INPUT_SIZE, INPUT_SIZE))?;
        embedder.dim = probe.len();
        log::info!("Face embedding dimension: {}", embedder.dim);

        Ok(embedder)
    }

    fn preprocess(face: &RgbImage) -> (Vec<i64>, Vec<f32>) {
        let resized = imageops::resize(face, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
        let mut data = Vec::with_capacity(3 * plane);
        for c in 0..3 {
            for p in resized.pixels() {
                data.push((p.0[c] as f32 - 127.5) / 128.0);
            }
        }
        (vec![1, 3, INPUT_SIZE as i64, INPUT_SIZE as i64], data)
    }

    fn run(&self, face: &RgbImage) -> Result<Vec<f32>> {
        let (shape, data) = Self::preprocess(face);
        let input =
            Value::from_array((shape, data)).context("Failed to create embedding input tensor")?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let input_name = session.inputs[0].name.clone();
        let outputs = session
            .run(ort::inputs![input_name => input])
            .context("Embedding inference failed")?;

        let key = outputs
            .keys()
            .next()
            .map(|k| k.to_string())
            .context("Embedding model produced no outputs")?;
        let value = outputs
            .get(&key)
            .context("Embedding output vanished")?;
        let (_, slice) = value
            .try_extract_tensor::<f32>()
            .context("Embedding output is not an f32 tensor")?;

        Ok(slice.to_vec())
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, frame: &Frame, bbox: &BoundingBox) -> Result<Descriptor> {
        let face = frame.crop(bbox)?;
        let values = self.run(&face)?;
        if values.len() != self.dim {
            bail!(
                "Embedding dimension changed: expected {}, got {}",
                self.dim,
                values.len()
            );
        }
        Ok(Descriptor::new(values)?.normalized())
    }
}
