//! Image embedding using local models
//!
//! Uses CLIP ViT-B/32 via the fastembed crate (ONNX runtime).
//!
//! # Model Details
//!
//! - Dimensions: 512
//! - Input: any decodable RGB image, resized by the model preprocessor
//!
//! Raw model output is never compared directly. Every vector, stored or
//! query, goes through [`normalize`] first so that cosine similarity is a
//! plain dot product.
//!
//! # Usage
//!
//! ```ignore
//! use shelfmatch_lib::embed::{decode_image, normalize, ClipEmbedder, ImageEmbedder};
//!
//! let mut embedder = ClipEmbedder::new()?;
//! let image = decode_image(&bytes)?;
//! let query = normalize(embedder.embed(&image)?)?;
//! ```

use std::sync::{Arc, Mutex};

use image::DynamicImage;

use crate::{Error, Result};

/// A raw vector embedding as returned by the model
pub type Embedding = Vec<f32>;

/// Allowed drift of a stored vector's norm from 1.0
pub const NORM_TOLERANCE: f32 = 1e-3;

/// Trait for image embedding models
///
/// Implementations must be deterministic for identical input and always
/// return vectors of [`dimension`](ImageEmbedder::dimension) length.
pub trait ImageEmbedder: Send {
    /// Embed a single decoded image
    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding>;

    /// Returns the embedding dimension
    fn dimension(&self) -> usize;

    /// Returns the model name/identifier
    fn model_name(&self) -> &str;
}

/// An embedder shared between concurrent queries and rebuilds
pub type SharedEmbedder = Arc<Mutex<dyn ImageEmbedder>>;

/// Embed and normalize an image on the blocking thread pool.
pub async fn embed_image_blocking(
    embedder: SharedEmbedder,
    image: Arc<DynamicImage>,
) -> Result<UnitVector> {
    tokio::task::spawn_blocking(move || {
        let raw = embedder
            .lock()
            .map_err(|_| Error::Embedding("embedder lock poisoned".to_string()))?
            .embed(&image)?;
        normalize(raw)
    })
    .await
    .map_err(|e| Error::Embedding(format!("embedding task failed: {e}")))?
}

/// Decode, embed and normalize raw image bytes on the blocking thread pool.
pub async fn embed_bytes_blocking(embedder: SharedEmbedder, bytes: Vec<u8>) -> Result<UnitVector> {
    let image = tokio::task::spawn_blocking(move || decode_image(&bytes))
        .await
        .map_err(|e| Error::Embedding(format!("decode task failed: {e}")))??;
    embed_image_blocking(embedder, Arc::new(image)).await
}

/// Adapts a [`SharedEmbedder`] to the `&mut` [`ImageEmbedder`] interface,
/// taking the lock per image so queries can interleave with a rebuild.
pub struct LockedEmbedder {
    inner: SharedEmbedder,
    dimension: usize,
    model_name: String,
}

impl LockedEmbedder {
    pub fn new(inner: SharedEmbedder) -> Result<Self> {
        let (dimension, model_name) = {
            let guard = inner
                .lock()
                .map_err(|_| Error::Embedding("embedder lock poisoned".to_string()))?;
            (guard.dimension(), guard.model_name().to_string())
        };
        Ok(Self {
            inner,
            dimension,
            model_name,
        })
    }
}

impl ImageEmbedder for LockedEmbedder {
    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding> {
        self.inner
            .lock()
            .map_err(|_| Error::Embedding("embedder lock poisoned".to_string()))?
            .embed(image)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// An embedding scaled to unit L2 norm.
///
/// Only [`normalize`] and [`UnitVector::from_normalized`] construct one, so
/// holding a `UnitVector` means the normalization step was not skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitVector(Vec<f32>);

impl UnitVector {
    /// Wraps a vector that is already unit length, such as one read back
    /// from disk. Fails with `DegenerateEmbedding` if the norm is off by more
    /// than [`NORM_TOLERANCE`].
    pub fn from_normalized(values: Vec<f32>) -> Result<Self> {
        let norm = l2_norm(&values);
        if !norm.is_finite() || (norm - 1.0).abs() > NORM_TOLERANCE {
            return Err(Error::DegenerateEmbedding);
        }
        Ok(Self(values))
    }

    /// Number of components.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// Cosine similarity with another unit vector.
    pub fn dot(&self, other: &UnitVector) -> Result<f32> {
        if self.dim() != other.dim() {
            return Err(Error::DimensionMismatch {
                expected: self.dim(),
                actual: other.dim(),
            });
        }
        Ok(dot(&self.0, &other.0))
    }
}

impl AsRef<[f32]> for UnitVector {
    fn as_ref(&self) -> &[f32] {
        &self.0
    }
}

/// Scale a raw embedding to unit length.
///
/// Fails with `DegenerateEmbedding` for an empty, all-zero or non-finite
/// vector.
pub fn normalize(mut raw: Embedding) -> Result<UnitVector> {
    let norm = l2_norm(&raw);
    if norm == 0.0 || !norm.is_finite() {
        return Err(Error::DegenerateEmbedding);
    }
    for value in &mut raw {
        *value /= norm;
    }
    Ok(UnitVector(raw))
}

/// Decode image bytes and convert to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes)
        .map(|img| DynamicImage::ImageRgb8(img.to_rgb8()))
        .map_err(|e| Error::InvalidInput(format!("undecodable image: {e}")))
}

pub(crate) fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

mod clip;

pub use clip::*;
