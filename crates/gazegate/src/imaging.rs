use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("image worker failed: {0}")]
    Worker(String),
}

/// Bounds applied to every image before it is uploaded for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Longest side in pixels.
    pub size: u32,
    /// JPEG quality, 1-100.
    pub quality: u8,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            size: 224,
            quality: 80,
        }
    }
}

/// Decode `bytes`, fit the image within `size × size` keeping its aspect
/// ratio, and re-encode it as an RGB JPEG. Smaller images are not upscaled.
pub fn normalize_image(bytes: &[u8], options: NormalizeOptions) -> Result<Vec<u8>, NormalizeError> {
    let img = image::load_from_memory(bytes).map_err(NormalizeError::Decode)?;

    let img = if img.width() > options.size || img.height() > options.size {
        img.resize(options.size, options.size, FilterType::Triangle)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, options.quality)
        .encode_image(&rgb)
        .map_err(NormalizeError::Encode)?;

    Ok(out)
}

/// [`normalize_image`] on the blocking pool.
pub async fn normalize_image_blocking(
    bytes: Vec<u8>,
    options: NormalizeOptions,
) -> Result<Vec<u8>, NormalizeError> {
    tokio::task::spawn_blocking(move || normalize_image(&bytes, options))
        .await
        .map_err(|e| NormalizeError::Worker(e.to_string()))?
}
