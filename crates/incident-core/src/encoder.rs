//! Photo transcoding for embedding inside an incident record.
//!
//! A captured photo is decoded, scaled down so its longest edge fits the
//! policy, recompressed as JPEG and finally base64 encoded so it can live in a
//! plain text field. The whole image stays in one buffer for every step.

use crate::error::EncodeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{debug, warn};

/// Fixed resize/recompress policy applied to every photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePolicy {
    pub max_dimension: u32,
    pub quality: u8,
}

pub const DEFAULT_POLICY: EncodePolicy = EncodePolicy {
    max_dimension: 800,
    quality: 70,
};

impl Default for EncodePolicy {
    fn default() -> Self {
        DEFAULT_POLICY
    }
}

impl EncodePolicy {
    /// Target dimensions for a `width` x `height` source. Never upscales.
    ///
    /// A `max_dimension` of zero is treated as one pixel.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let max_dimension = self.max_dimension.max(1);
        let longest = width.max(height);
        if longest == 0 {
            return (width, height);
        }
        let scale = (max_dimension as f64 / longest as f64).min(1.0);
        if scale >= 1.0 {
            return (width, height);
        }
        let scaled = |edge: u32| ((edge as f64 * scale) as u32).clamp(1, max_dimension);
        (scaled(width), scaled(height))
    }
}

/// Base64 text of a JPEG, or empty when no photo could be produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedPhoto(String);

impl EncodedPhoto {
    /// The failure sentinel.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Run the full pipeline with the default policy, reporting why it failed.
pub fn try_encode(raw: &[u8]) -> Result<EncodedPhoto, EncodeError> {
    try_encode_with(raw, &DEFAULT_POLICY)
}

pub fn try_encode_with(raw: &[u8], policy: &EncodePolicy) -> Result<EncodedPhoto, EncodeError> {
    let source = image::load_from_memory(raw).map_err(EncodeError::Decode)?;
    let (width, height) = (source.width(), source.height());
    let (target_w, target_h) = policy.target_dimensions(width, height);

    let resized = if (target_w, target_h) != (width, height) {
        source.resize_exact(target_w, target_h, FilterType::Lanczos3)
    } else {
        source
    };

    // JPEG has no alpha channel.
    let rgb = resized.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, policy.quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(EncodeError::Encode)?;

    debug!(
        "Encoded photo {}x{} -> {}x{}, {} raw bytes -> {} jpeg bytes",
        width,
        height,
        target_w,
        target_h,
        raw.len(),
        jpeg.len()
    );

    Ok(EncodedPhoto(STANDARD.encode(&jpeg)))
}

/// Encode a photo, folding any failure into the empty sentinel.
pub fn encode(raw: &[u8]) -> EncodedPhoto {
    match try_encode(raw) {
        Ok(photo) => photo,
        Err(e) => {
            warn!("Photo could not be encoded: {}", e);
            EncodedPhoto::empty()
        }
    }
}

/// Encode on the blocking pool so the caller's task keeps serving input.
pub async fn encode_async(raw: Vec<u8>) -> EncodedPhoto {
    match tokio::task::spawn_blocking(move || encode(&raw)).await {
        Ok(photo) => photo,
        Err(e) => {
            warn!("Photo encoding task failed: {}", e);
            EncodedPhoto::empty()
        }
    }
}

/// Reverse of [`encode`]. Anything that does not yield an image is `None`.
///
/// Payloads written by older clients carry MIME line breaks, so ASCII
/// whitespace is ignored.
pub fn decode(encoded: &str) -> Option<DynamicImage> {
    if encoded.is_empty() {
        return None;
    }

    let bytes = if encoded.bytes().any(|b| b.is_ascii_whitespace()) {
        let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        STANDARD.decode(compact)
    } else {
        STANDARD.decode(encoded)
    };

    let bytes = match bytes {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Photo payload is not valid base64: {}", e);
            return None;
        }
    };

    match image::load_from_memory(&bytes) {
        Ok(img) => Some(img),
        Err(e) => {
            debug!("Photo payload is not a decodable image: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let mut seed = 0x2545_f491_u32;
        let img = RgbImage::from_fn(width, height, |_, _| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let [r, g, b, _] = seed.to_le_bytes();
            Rgb([r, g, b])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn flat_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_target_dimensions() {
        let policy = DEFAULT_POLICY;
        assert_eq!(policy.target_dimensions(1600, 1200), (800, 600));
        assert_eq!(policy.target_dimensions(1200, 1600), (600, 800));
        assert_eq!(policy.target_dimensions(800, 800), (800, 800));
        assert_eq!(policy.target_dimensions(640, 480), (640, 480));
        assert_eq!(policy.target_dimensions(8000, 10), (800, 1));
        assert_eq!(policy.target_dimensions(3000, 2000), (800, 533));
    }

    #[test]
    fn test_zero_max_dimension() {
        let policy = EncodePolicy {
            max_dimension: 0,
            quality: 70,
        };
        assert_eq!(policy.target_dimensions(1600, 1200), (1, 1));
        assert_eq!(policy.target_dimensions(1, 1), (1, 1));

        let encoded = try_encode_with(&flat_png(40, 20), &policy).unwrap();
        let decoded = decode(encoded.as_str()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1, 1));
    }

    #[test]
    fn test_large_image_downscaled() {
        let raw = noisy_png(1600, 1200);
        let encoded = encode(&raw);
        assert!(!encoded.is_empty());

        let decoded = decode(encoded.as_str()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (800, 600));
        assert!(encoded.as_str().len() < raw.len());
    }

    #[test]
    fn test_tall_image_keeps_aspect() {
        let encoded = encode(&flat_png(400, 2000));
        let decoded = decode(encoded.as_str()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (160, 800));
    }

    #[test]
    fn test_small_image_not_upscaled() {
        let encoded = encode(&flat_png(640, 480));
        let decoded = decode(encoded.as_str()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
    }

    #[test]
    fn test_alpha_flattened() {
        let img = RgbaImage::from_pixel(32, 16, Rgba([10, 20, 30, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();

        let encoded = encode(&out.into_inner());
        let decoded = decode(encoded.as_str()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }

    #[test]
    fn test_garbage_yields_sentinel() {
        assert!(encode(b"definitely not an image").is_empty());
        assert!(encode(&[]).is_empty());
        assert!(matches!(try_encode(b"\x89PNG\r\n"), Err(EncodeError::Decode(_))));
    }

    #[test]
    fn test_decode_failures_are_none() {
        assert!(decode("").is_none());
        assert!(decode(EncodedPhoto::empty().as_str()).is_none());
        assert!(decode("***not base64***").is_none());
        // valid base64, not an image
        assert!(decode("aGVsbG8gd29ybGQ=").is_none());
    }

    #[test]
    fn test_decode_ignores_line_breaks() {
        let encoded = encode(&flat_png(64, 64)).into_string();
        let wrapped: String = encoded
            .as_bytes()
            .chunks(76)
            .map(|chunk| format!("{}\n", std::str::from_utf8(chunk).unwrap()))
            .collect();

        let decoded = decode(&wrapped).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 64));
    }

    #[tokio::test]
    async fn test_encode_async_matches_sync() {
        let raw = flat_png(100, 50);
        let photo = encode_async(raw.clone()).await;
        assert_eq!(photo, encode(&raw));
    }
}
