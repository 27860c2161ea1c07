use crate::core::metrics::{ImageFacts, MetricName, MetricProvider};
use crate::error::CoreError;
use image::{DynamicImage, GenericImageView, GrayImage, ImageReader};
use image_hasher::{HashAlg, Hasher, HasherConfig};
use std::fs::File;
use std::path::Path;

/// Longest side of the thumbnail pixel metrics are computed on.
const ANALYSIS_SIZE: u32 = 512;

/// Side length of the perceptual hash grid; embeddings have `HASH_SIZE²` bits.
pub const HASH_SIZE: u32 = 16;

/// Default provider: decodes with `image`, embeds with a DCT mean hash.
pub struct ImageAnalyzer {
    hasher: Hasher,
}

impl ImageAnalyzer {
    pub fn new() -> Self {
        let hasher = HasherConfig::new()
            .hash_size(HASH_SIZE, HASH_SIZE)
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .to_hasher();
        Self { hasher }
    }

    fn decode(&self, path: &Path) -> Result<DynamicImage, CoreError> {
        ImageReader::open(path)
            .map_err(|e| CoreError::filesystem(path, e))?
            .with_guessed_format()
            .map_err(|e| CoreError::filesystem(path, e))?
            .decode()
            .map_err(|e| CoreError::unsupported(path, e))
    }

    /// Hash bits as a ±1 vector, so cosine similarity tracks Hamming distance.
    fn embed(&self, image: &DynamicImage) -> Vec<f32> {
        let hash = self.hasher.hash_image(image);
        hash.as_bytes()
            .iter()
            .flat_map(|byte| (0..8).map(move |bit| if (*byte >> bit) & 1 == 1 { 1.0 } else { -1.0 }))
            .collect()
    }

    /// Center crop first, then the four corners; each side is half the
    /// shorter image side.
    fn region_crops(image: &DynamicImage, count: usize) -> Vec<DynamicImage> {
        let (w, h) = image.dimensions();
        let side = w.min(h) / 2;
        if side == 0 {
            return Vec::new();
        }
        let origins = [
            ((w - side) / 2, (h - side) / 2),
            (0, 0),
            (w - side, 0),
            (0, h - side),
            (w - side, h - side),
        ];
        origins
            .iter()
            .take(count)
            .map(|&(x, y)| image.crop_imm(x, y, side, side))
            .collect()
    }

    fn laplacian_variance(gray: &GrayImage) -> f64 {
        let (width, height) = gray.dimensions();
        if width < 3 || height < 3 {
            return 0.0;
        }
        let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
        let mut sum = 0.0;
        let mut count = 0usize;
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let laplacian =
                    4.0 * px(x, y) - px(x - 1, y) - px(x + 1, y) - px(x, y - 1) - px(x, y + 1);
                sum += laplacian * laplacian;
                count += 1;
            }
        }
        sum / count as f64
    }

    fn sharpness(gray: &GrayImage) -> f64 {
        (Self::laplacian_variance(gray) / 1000.0).min(1.0)
    }

    fn exposure(image: &DynamicImage) -> f64 {
        let rgb = image.to_rgb8();
        let total = (rgb.width() as f64 * rgb.height() as f64).max(1.0);
        let brightness: f64 = rgb
            .pixels()
            .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
            .sum();
        let normalized = brightness / total / 255.0;
        (1.0 - (normalized - 0.5).abs() * 2.0).clamp(0.0, 1.0)
    }

    /// Inverse of the mean absolute deviation from the 3x3 box mean.
    fn noise(gray: &GrayImage) -> f64 {
        let (width, height) = gray.dimensions();
        if width < 3 || height < 3 {
            return 1.0;
        }
        let mut deviation = 0.0;
        let mut count = 0usize;
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let mut local = 0.0;
                for dy in 0..3 {
                    for dx in 0..3 {
                        local += gray.get_pixel(x + dx - 1, y + dy - 1)[0] as f64;
                    }
                }
                deviation += (gray.get_pixel(x, y)[0] as f64 - local / 9.0).abs();
                count += 1;
            }
        }
        1.0 / (1.0 + deviation / count as f64)
    }
}

impl Default for ImageAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricProvider for ImageAnalyzer {
    fn probe(&self, path: &Path) -> Result<ImageFacts, CoreError> {
        let metadata = std::fs::metadata(path).map_err(|e| CoreError::filesystem(path, e))?;
        let (width, height) =
            image::image_dimensions(path).map_err(|e| CoreError::unsupported(path, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| CoreError::metric_unavailable(path, e))?;
        Ok(ImageFacts {
            width,
            height,
            size_bytes: metadata.len(),
            modified,
            created: metadata.created().ok(),
        })
    }

    fn measure(&self, path: &Path, metrics: &[MetricName]) -> Result<Vec<f64>, CoreError> {
        let image = self.decode(path)?.thumbnail(ANALYSIS_SIZE, ANALYSIS_SIZE);
        let gray = image.to_luma8();
        metrics
            .iter()
            .map(|metric| match metric {
                MetricName::Sharpness => Ok(Self::sharpness(&gray)),
                MetricName::Exposure => Ok(Self::exposure(&image)),
                MetricName::Noise => Ok(Self::noise(&gray)),
                other => Err(CoreError::metric_unavailable(
                    path,
                    format!("{other} is not a pixel metric"),
                )),
            })
            .collect()
    }

    fn embedding(&self, path: &Path) -> Result<Vec<f32>, CoreError> {
        let image = self.decode(path)?;
        Ok(self.embed(&image))
    }

    fn regions(&self, path: &Path, count: usize) -> Result<Vec<Vec<f32>>, CoreError> {
        let image = self.decode(path)?;
        let crops = Self::region_crops(&image, count);
        if crops.is_empty() && count > 0 {
            return Err(CoreError::metric_unavailable(path, "image too small for regions"));
        }
        Ok(crops.iter().map(|crop| self.embed(crop)).collect())
    }

    fn content_hash(&self, path: &Path) -> Result<String, CoreError> {
        let file = File::open(path).map_err(|e| CoreError::filesystem(path, e))?;
        let mut hasher = blake3::Hasher::new();
        hasher
            .update_reader(file)
            .map_err(|e| CoreError::filesystem(path, e))?;
        Ok(hasher.finalize().to_hex().to_string())
    }
}
