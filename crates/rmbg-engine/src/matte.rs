//! Border-colour matting: the default background-removal processor.

use crate::{EngineConfig, EngineError, ImageProcessor};
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage, RgbaImage};
use std::path::Path;

/// Colour distance (0..=1) that maps to a full foreground score.
const FULL_SCORE_DISTANCE: f32 = 0.25;

/// Estimates the background colour from the image border at the working resolution,
/// scores each pixel by its distance to it, and writes the thresholded mask as alpha.
pub struct BorderMatte {
    config: EngineConfig,
}

impl BorderMatte {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn background(small: &RgbImage) -> [f32; 3] {
        let (w, h) = small.dimensions();
        let mut sum = [0f64; 3];
        let mut n = 0u64;
        for (x, y, px) in small.enumerate_pixels() {
            if x == 0 || y == 0 || x + 1 == w || y + 1 == h {
                for (c, v) in px.0.iter().enumerate() {
                    sum[c] += *v as f64;
                }
                n += 1;
            }
        }
        let n = n.max(1) as f64;
        [
            (sum[0] / n) as f32,
            (sum[1] / n) as f32,
            (sum[2] / n) as f32,
        ]
    }

    /// Foreground score per pixel at the working resolution.
    fn scores(&self, rgb: &RgbImage) -> GrayImage {
        let size = self.config.img_size.max(1);
        let small = imageops::resize(rgb, size, size, FilterType::Triangle);
        let bg = Self::background(&small);
        let max_dist = (3.0f32 * 255.0 * 255.0).sqrt();
        GrayImage::from_fn(size, size, |x, y| {
            let Rgb([r, g, b]) = *small.get_pixel(x, y);
            let d = ((r as f32 - bg[0]).powi(2)
                + (g as f32 - bg[1]).powi(2)
                + (b as f32 - bg[2]).powi(2))
            .sqrt()
                / max_dist;
            let score = (d / FULL_SCORE_DISTANCE).min(1.0);
            Luma([(score * 255.0).round() as u8])
        })
    }
}

impl ImageProcessor for BorderMatte {
    fn process(&mut self, input: &Path, output: &Path) -> Result<(), EngineError> {
        let bytes = std::fs::read(input)?;
        let rgb = image::load_from_memory(&bytes)
            .map_err(|e| EngineError::Decode(e.to_string()))?
            .to_rgb8();
        let (w, h) = rgb.dimensions();

        let mask = imageops::resize(&self.scores(&rgb), w, h, FilterType::Triangle);
        let cut = (self.config.threshold * 255.0).round() as u8;
        let rgba = RgbaImage::from_fn(w, h, |x, y| {
            let Rgb([r, g, b]) = *rgb.get_pixel(x, y);
            let alpha = if mask.get_pixel(x, y).0[0] > cut { 255 } else { 0 };
            image::Rgba([r, g, b, alpha])
        });
        rgba.save_with_format(output, ImageFormat::Png)
            .map_err(|e| EngineError::Encode(e.to_string()))
    }
}
