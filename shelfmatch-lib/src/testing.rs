//! Deterministic fakes shared by unit tests.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::embed::{Embedding, ImageEmbedder};
use crate::{Error, Result};

/// Embeds an image as its mean RGB colour.
///
/// A pure black image embeds to the zero vector, which exercises the
/// degenerate-embedding path.
#[derive(Debug, Default)]
pub struct MeanColorEmbedder {
    pub calls: usize,
}

impl ImageEmbedder for MeanColorEmbedder {
    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding> {
        self.calls += 1;
        let rgb = image.to_rgb8();
        let pixels = (rgb.width() * rgb.height()).max(1) as f32;
        let mut sum = [0f32; 3];
        for pixel in rgb.pixels() {
            for (acc, channel) in sum.iter_mut().zip(pixel.0) {
                *acc += f32::from(channel);
            }
        }
        Ok(sum.iter().map(|c| c / pixels).collect())
    }

    fn dimension(&self) -> usize {
        3
    }

    fn model_name(&self) -> &str {
        "mean-color"
    }
}

/// Always fails, for error-path tests.
#[derive(Debug, Default)]
pub struct FailingEmbedder;

impl ImageEmbedder for FailingEmbedder {
    fn embed(&mut self, _image: &DynamicImage) -> Result<Embedding> {
        Err(Error::Embedding("model crashed".to_string()))
    }

    fn dimension(&self) -> usize {
        3
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

/// A small solid-colour image.
pub fn solid(color: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb(color)))
}

/// PNG bytes of a small solid-colour image.
pub fn png_bytes(color: [u8; 3]) -> Vec<u8> {
    let mut bytes = Vec::new();
    solid(color)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode png");
    bytes
}

/// Write a solid-colour PNG to `path`.
pub fn write_png(path: &Path, color: [u8; 3]) {
    std::fs::write(path, png_bytes(color)).expect("write png");
}
