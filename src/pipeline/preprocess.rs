//! Image enhancement before recognition.
//!
//! `ImagePipeline` runs a fixed, ordered sequence of steps on one source
//! image and writes the result to a single well-known path:
//!
//! decode → EXIF orientation → grayscale → upscale → bilateral denoise →
//! CLAHE → adaptive threshold → ink closing → PNG
//!
//! Every step can be switched off through `EnhancementConfig`, but the
//! relative order never changes. The output path is overwritten by each
//! job, so callers must hold the job lock while enhancing.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::{DynamicImage, ImageOutputFormat, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::filters;
use super::EnhanceError;

// ═══════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════

/// Numeric parameters and on/off switches for each enhancement step.
///
/// A step is disabled by its neutral value: `upscale_factor = 1`,
/// `denoise_strength = 0`, `clahe_grid = 0`, `threshold_block_size = 0`,
/// `close_kernel = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancementConfig {
    pub correct_orientation: bool,
    pub grayscale: bool,
    /// Integer upscale factor (1..=8).
    pub upscale_factor: u32,
    /// Long-edge cap applied when upscaling.
    pub max_output_dimension: u32,
    /// Bilateral range sigma.
    pub denoise_strength: f32,
    pub clahe_clip_limit: f32,
    pub clahe_grid: u32,
    /// Odd window size for the adaptive threshold.
    pub threshold_block_size: u32,
    pub threshold_offset: f32,
    pub close_kernel: u32,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            correct_orientation: true,
            grayscale: true,
            upscale_factor: 3,
            max_output_dimension: 4096,
            denoise_strength: 30.0,
            clahe_clip_limit: 3.0,
            clahe_grid: 8,
            threshold_block_size: 15,
            threshold_offset: 5.0,
            close_kernel: 2,
        }
    }
}

impl EnhancementConfig {
    /// Only orientation and scaling; no tonal changes.
    pub fn minimal() -> Self {
        Self {
            grayscale: false,
            upscale_factor: 1,
            denoise_strength: 0.0,
            clahe_grid: 0,
            threshold_block_size: 0,
            close_kernel: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=8).contains(&self.upscale_factor) {
            return Err(format!(
                "upscale_factor must be within 1..=8, got {}",
                self.upscale_factor
            ));
        }
        if self.max_output_dimension == 0 {
            return Err("max_output_dimension must be > 0".into());
        }
        if self.denoise_strength < 0.0 || !self.denoise_strength.is_finite() {
            return Err("denoise_strength must be a non-negative number".into());
        }
        let block = self.threshold_block_size;
        if block != 0 && (block < 3 || block % 2 == 0) {
            return Err(format!(
                "threshold_block_size must be odd and >= 3 (or 0 to disable), got {block}"
            ));
        }
        if !self.grayscale && self.has_tonal_steps() {
            return Err("denoise, CLAHE, threshold and closing require grayscale".into());
        }
        Ok(())
    }

    fn has_tonal_steps(&self) -> bool {
        self.denoise_strength > 0.0
            || self.clahe_grid > 0
            || self.threshold_block_size > 0
            || self.close_kernel > 1
    }
}

// ═══════════════════════════════════════════════════════════
// Service trait
// ═══════════════════════════════════════════════════════════

/// Turns a source image into the file handed to recognizers.
pub trait ImageEnhancer: Send + Sync {
    /// Enhance `source` and return the path of the enhanced artifact.
    fn enhance(&self, source: &Path) -> Result<PathBuf, EnhanceError>;
}

// ═══════════════════════════════════════════════════════════
// ImagePipeline
// ═══════════════════════════════════════════════════════════

pub struct ImagePipeline {
    config: EnhancementConfig,
    output_path: PathBuf,
}

impl ImagePipeline {
    pub fn new(config: EnhancementConfig, output_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            output_path: output_path.into(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Run every enabled step on decoded bytes and return PNG bytes.
    pub fn enhance_bytes(&self, raw: &[u8]) -> Result<Vec<u8>, String> {
        let decoded = image::load_from_memory(raw).map_err(|e| e.to_string())?;
        let oriented = if self.config.correct_orientation {
            apply_orientation(decoded, read_exif_orientation(raw))
        } else {
            decoded
        };

        let processed = if self.config.grayscale {
            DynamicImage::ImageLuma8(self.tonal_steps(&oriented.to_rgb8()))
        } else {
            DynamicImage::ImageRgb8(self.scale_color(oriented.to_rgb8()))
        };

        let mut cursor = Cursor::new(Vec::new());
        processed
            .write_to(&mut cursor, ImageOutputFormat::Png)
            .map_err(|e| format!("PNG encoding failed: {e}"))?;
        Ok(cursor.into_inner())
    }

    fn tonal_steps(&self, rgb: &RgbImage) -> image::GrayImage {
        let c = &self.config;
        let mut img = filters::to_grayscale(rgb);

        // Runs at factor 1 too: it is also the long-edge cap
        img = filters::upscale(&img, c.upscale_factor.max(1), c.max_output_dimension);
        if c.denoise_strength > 0.0 {
            img = filters::bilateral_denoise(&img, filters::BILATERAL_RADIUS, c.denoise_strength);
        }
        if c.clahe_grid > 0 {
            img = filters::clahe(&img, c.clahe_clip_limit, c.clahe_grid);
        }
        if c.threshold_block_size > 0 {
            img = filters::adaptive_threshold(&img, c.threshold_block_size, c.threshold_offset);
        }
        if c.close_kernel > 1 {
            img = filters::close_ink(&img, c.close_kernel);
        }
        img
    }

    fn scale_color(&self, rgb: RgbImage) -> RgbImage {
        let c = &self.config;
        let (w, h) = rgb.dimensions();
        let (new_w, new_h) =
            filters::upscaled_dimensions(w, h, c.upscale_factor, c.max_output_dimension);
        if (new_w, new_h) == (w, h) {
            return rgb;
        }
        image::imageops::resize(&rgb, new_w, new_h, image::imageops::FilterType::CatmullRom)
    }
}

impl ImageEnhancer for ImagePipeline {
    fn enhance(&self, source: &Path) -> Result<PathBuf, EnhanceError> {
        let started = Instant::now();
        let raw = std::fs::read(source).map_err(|e| EnhanceError::UnreadableImage {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;

        let png = self
            .enhance_bytes(&raw)
            .map_err(|reason| EnhanceError::UnreadableImage {
                path: source.to_path_buf(),
                reason,
            })?;

        let write_failure = |e: std::io::Error| EnhanceError::WriteFailure {
            path: self.output_path.clone(),
            reason: e.to_string(),
        };
        if let Some(parent) = self.output_path.parent() {
            std::fs::create_dir_all(parent).map_err(write_failure)?;
        }
        std::fs::write(&self.output_path, &png).map_err(write_failure)?;

        info!(
            source = %source.display(),
            output = %self.output_path.display(),
            bytes = png.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image enhanced"
        );
        Ok(self.output_path.clone())
    }
}

// ── EXIF orientation ──────────────────────────────────────

/// Read EXIF tag 0x0112 (Orientation). Returns 1 (normal) when absent.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let exif = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => exif,
        Err(_) => return 1,
    };

    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Rotate/flip so the image is upright.
///
/// 1 = normal, 2 = mirrored, 3 = 180°, 4 = flipped vertically,
/// 5 = mirrored + 90° CW, 6 = 90° CW, 7 = mirrored + 270° CW, 8 = 270° CW.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    if orientation != 1 {
        debug!(orientation, "Applying EXIF orientation");
    }
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

// ── Test double ───────────────────────────────────────────

/// Enhancer that skips image work: hands back the source path, or fails.
pub struct MockEnhancer {
    fail: bool,
}

impl MockEnhancer {
    pub fn new() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl Default for MockEnhancer {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageEnhancer for MockEnhancer {
    fn enhance(&self, source: &Path) -> Result<PathBuf, EnhanceError> {
        if self.fail {
            return Err(EnhanceError::UnreadableImage {
                path: source.to_path_buf(),
                reason: "mock enhancer failure".into(),
            });
        }
        Ok(source.to_path_buf())
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
