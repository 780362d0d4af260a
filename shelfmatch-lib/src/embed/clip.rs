use std::io::Cursor;

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions};
use image::{DynamicImage, ImageFormat};

use crate::embed::{Embedding, ImageEmbedder};
use crate::{Error, Result};

/// CLIP image embedder using Qdrant/clip-ViT-B-32-vision.
///
/// Uses fastembed for ONNX-based inference. This model produces 512-dimensional
/// embeddings.
pub struct ClipEmbedder {
    model: ImageEmbedding,
}

impl ClipEmbedder {
    /// Create a new CLIP embedder.
    ///
    /// Downloads the model on first use (~350MB).
    pub fn new() -> Result<Self> {
        let opts = ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
            .with_show_download_progress(true);

        ImageEmbedding::try_new(opts)
            .map(|model| Self { model })
            .map_err(|e| Error::Embedding(e.to_string()))
    }
}

impl ImageEmbedder for ClipEmbedder {
    fn model_name(&self) -> &str {
        "Qdrant/clip-ViT-B-32-vision"
    }

    fn dimension(&self) -> usize {
        512
    }

    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding> {
        // fastembed decodes from bytes itself, so hand it a lossless re-encode
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| Error::Embedding(format!("failed to encode image: {e}")))?;

        self.model
            .embed_bytes(&[png.as_slice()], None)
            .map_err(|e| Error::Embedding(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("model returned no embeddings".to_string()))
    }
}
