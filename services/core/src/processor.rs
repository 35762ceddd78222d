use crate::object_store::{optimized_key, ObjectStore, ObjectStoreError};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Raster formats accepted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => ".jpg",
            ImageFormat::Png => ".png",
        }
    }
}

/// Errors produced while validating or transforming an image.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("error encoding processed image: {0}")]
    Encode(String),

    #[error(transparent)]
    Store(#[from] ObjectStoreError),
}

impl ProcessorError {
    /// A permanent error cannot succeed on redelivery: the same bytes will
    /// decode or encode the same way every time. A missing original object is
    /// also permanent, since nothing about a retry will bring it back.
    pub fn is_permanent(&self) -> bool {
        match self {
            ProcessorError::UnsupportedFormat(_)
            | ProcessorError::InvalidImage(_)
            | ProcessorError::Encode(_) => true,
            ProcessorError::Store(ObjectStoreError::NotFound(_)) => true,
            ProcessorError::Store(ObjectStoreError::Transport(_)) => false,
        }
    }
}

/// Dimensions, size and format of a validated image.
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub size: i64,
    pub format: ImageFormat,
}

/// Effective processing parameters for one task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub quality: u8,
    pub optimize_storage: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_width: 1200,
            max_height: 1200,
            quality: 85,
            optimize_storage: true,
        }
    }
}

/// Output of a processing run, ready for the terminal repository write.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub optimized_path: String,
    pub optimized_size: i64,
    pub optimized_width: i32,
    pub optimized_height: i32,
}

fn detect_format(data: &[u8]) -> Result<ImageFormat, ProcessorError> {
    match image::guess_format(data) {
        Ok(image::ImageFormat::Jpeg) => Ok(ImageFormat::Jpeg),
        Ok(image::ImageFormat::Png) => Ok(ImageFormat::Png),
        Ok(other) => Err(ProcessorError::UnsupportedFormat(
            format!("{other:?}").to_lowercase(),
        )),
        Err(e) => Err(ProcessorError::InvalidImage(e.to_string())),
    }
}

/// Decode and verify an uploaded payload, returning its dimensions, byte size
/// and format. Anything that is not a JPEG or PNG is rejected.
pub fn validate(data: &[u8]) -> Result<ImageInfo, ProcessorError> {
    let format = detect_format(data)?;
    let img =
        image::load_from_memory(data).map_err(|e| ProcessorError::InvalidImage(e.to_string()))?;

    Ok(ImageInfo {
        width: img.width(),
        height: img.height(),
        size: data.len() as i64,
        format,
    })
}

/// Aspect-preserving fit of `(width, height)` into `(max_width, max_height)`.
///
/// Images already inside the bounds keep their dimensions (never upscale), and
/// a non-positive bound disables resizing entirely.
pub fn target_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if max_width == 0 || max_height == 0 || width == 0 || height == 0 {
        return (width, height);
    }

    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );

    if scale >= 1.0 {
        return (width, height);
    }

    // Extreme aspect ratios can floor a side to zero; a 1px floor keeps the
    // resampler happy while staying within the bounds.
    (
        ((width as f64 * scale).floor() as u32).max(1),
        ((height as f64 * scale).floor() as u32).max(1),
    )
}

/// Whether the re-encoded bytes are worth persisting as a separate object.
/// When this is false the variant just references the original (no-gain
/// fallback).
pub fn should_upload(
    encoded_len: usize,
    original_len: usize,
    resized: bool,
    optimize_storage: bool,
) -> bool {
    encoded_len < original_len || resized || optimize_storage
}

/// An in-memory optimized rendition.
#[derive(Debug)]
pub struct Optimized {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub resized: bool,
}

/// Decode, resample and re-encode a payload per `config`. CPU-bound; callers
/// run this under `spawn_blocking`.
pub fn optimize(data: &[u8], config: &ProcessConfig) -> Result<Optimized, ProcessorError> {
    let format = detect_format(data)?;
    let img =
        image::load_from_memory(data).map_err(|e| ProcessorError::InvalidImage(e.to_string()))?;

    let (width, height) = (img.width(), img.height());
    let (new_width, new_height) =
        target_dimensions(width, height, config.max_width, config.max_height);
    let resized = new_width != width || new_height != height;

    let output = if resized {
        img.resize_exact(new_width, new_height, FilterType::Lanczos3)
    } else {
        img
    };

    let encoded = encode(&output, format, config.quality)?;

    Ok(Optimized {
        data: encoded,
        width: new_width,
        height: new_height,
        format,
        resized,
    })
}

/// Re-encode a raster in its original format. JPEG quality is clamped to
/// 1..=100; PNG always uses best compression.
pub fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, ProcessorError> {
    let mut out = Vec::new();

    match format {
        ImageFormat::Jpeg => {
            // JPEG carries no alpha and at most 8 bits per channel.
            let img = to_jpeg_compatible(img);
            let quality = quality.clamp(1, 100);
            let encoder = JpegEncoder::new_with_quality(&mut out, quality);
            encoder
                .write_image(img.as_bytes(), img.width(), img.height(), img.color())
                .map_err(|e| ProcessorError::Encode(e.to_string()))?;
        }
        ImageFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut out,
                CompressionType::Best,
                PngFilterType::Adaptive,
            );
            encoder
                .write_image(img.as_bytes(), img.width(), img.height(), img.color())
                .map_err(|e| ProcessorError::Encode(e.to_string()))?;
        }
    }

    Ok(out)
}

fn to_jpeg_compatible(img: &DynamicImage) -> std::borrow::Cow<'_, DynamicImage> {
    let color = img.color();
    if color.has_alpha() || color.bytes_per_pixel() / color.channel_count() > 1 {
        std::borrow::Cow::Owned(DynamicImage::from(img.to_rgb8()))
    } else {
        std::borrow::Cow::Borrowed(img)
    }
}

/// Fetches originals from the object store, optimizes them and persists the
/// winning rendition.
#[derive(Clone)]
pub struct ImageProcessor {
    store: ObjectStore,
}

impl ImageProcessor {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Run the full optimization pass for one image.
    ///
    /// When the re-encoded output is no smaller than the original, nothing was
    /// resized and storage optimization is off, the result points back at
    /// `original_path` with the original dimensions.
    #[instrument(skip(self, config), fields(image_id = %id, path = %original_path))]
    pub async fn process(
        &self,
        id: Uuid,
        original_path: &str,
        filename: &str,
        config: ProcessConfig,
    ) -> Result<ProcessingResult, ProcessorError> {
        let original = self.store.get(original_path).await?;
        let original_len = original.len();

        debug!(size = original_len, "Fetched original image");

        let cfg = config;
        let optimized = tokio::task::spawn_blocking(move || optimize(&original, &cfg))
            .await
            .map_err(|e| ProcessorError::Encode(format!("processing task panicked: {e}")))??;

        if should_upload(
            optimized.data.len(),
            original_len,
            optimized.resized,
            config.optimize_storage,
        ) {
            let ext = extension_of(filename).unwrap_or_else(|| optimized.format.extension().to_string());
            let key = optimized_key(id, &ext);
            let size = optimized.data.len() as i64;
            let (width, height) = (optimized.width, optimized.height);

            self.store
                .put(&key, Bytes::from(optimized.data), optimized.format.content_type())
                .await?;

            info!(
                key = %key,
                original_size = original_len,
                optimized_size = size,
                reduction_percent = (1.0 - size as f64 / original_len as f64) * 100.0,
                "Image optimized and uploaded"
            );

            return Ok(ProcessingResult {
                optimized_path: key,
                optimized_size: size,
                optimized_width: width as i32,
                optimized_height: height as i32,
            });
        }

        info!("No optimization gain, referencing original image");

        Ok(ProcessingResult {
            optimized_path: original_path.to_string(),
            optimized_size: original_len as i64,
            optimized_width: optimized.width as i32,
            optimized_height: optimized.height as i32,
        })
    }
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::io::Cursor;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        }))
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, 90);
        let img = gradient(width, height);
        encoder
            .write_image(img.as_bytes(), width, height, img.color())
            .unwrap();
        out
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        gradient(width, height)
            .write_to(&mut out, image::ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn target_dimensions_scales_down_preserving_aspect() {
        assert_eq!(target_dimensions(2048, 1536, 1200, 1200), (1200, 900));
        assert_eq!(target_dimensions(1000, 800, 500, 500), (500, 400));
        assert_eq!(target_dimensions(800, 1000, 500, 500), (400, 500));
    }

    #[test]
    fn target_dimensions_never_upscales() {
        assert_eq!(target_dimensions(300, 200, 1200, 1200), (300, 200));
        assert_eq!(target_dimensions(1200, 900, 1200, 1200), (1200, 900));
    }

    #[test]
    fn target_dimensions_zero_bound_disables_resize() {
        assert_eq!(target_dimensions(2048, 1536, 0, 1200), (2048, 1536));
        assert_eq!(target_dimensions(2048, 1536, 1200, 0), (2048, 1536));
    }

    #[test]
    fn target_dimensions_floors_at_one_pixel() {
        assert_eq!(target_dimensions(10_000, 1, 100, 100), (100, 1));
    }

    #[test]
    fn validate_accepts_jpeg() {
        let info = validate(&jpeg_bytes(64, 48)).unwrap();
        assert_eq!(info.format, ImageFormat::Jpeg);
        assert_eq!((info.width, info.height), (64, 48));
        assert!(info.size > 0);
    }

    #[test]
    fn validate_accepts_png() {
        let info = validate(&png_bytes(32, 32)).unwrap();
        assert_eq!(info.format, ImageFormat::Png);
    }

    #[test]
    fn validate_rejects_gif() {
        let mut out = Cursor::new(Vec::new());
        gradient(16, 16)
            .write_to(&mut out, image::ImageOutputFormat::Gif)
            .unwrap();
        let err = validate(&out.into_inner()).unwrap_err();
        assert!(matches!(err, ProcessorError::UnsupportedFormat(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn validate_rejects_garbage() {
        let err = validate(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidImage(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn optimize_resizes_large_jpeg() {
        let data = jpeg_bytes(2048, 1536);
        let out = optimize(&data, &ProcessConfig::default()).unwrap();
        assert!(out.resized);
        assert_eq!((out.width, out.height), (1200, 900));
        assert_eq!(out.format, ImageFormat::Jpeg);
        assert_eq!(validate(&out.data).unwrap().format, ImageFormat::Jpeg);
    }

    #[test]
    fn optimize_keeps_small_image_dimensions() {
        let data = jpeg_bytes(300, 200);
        let out = optimize(&data, &ProcessConfig::default()).unwrap();
        assert!(!out.resized);
        assert_eq!((out.width, out.height), (300, 200));
    }

    #[test]
    fn optimize_preserves_png_format() {
        let data = png_bytes(1600, 1600);
        let out = optimize(&data, &ProcessConfig::default()).unwrap();
        assert!(out.resized);
        assert_eq!((out.width, out.height), (1200, 1200));
        assert_eq!(validate(&out.data).unwrap().format, ImageFormat::Png);
    }

    #[test]
    fn encode_clamps_jpeg_quality() {
        let img = gradient(32, 32);
        // Quality 0 would be rejected by the encoder; the clamp keeps it legal.
        assert!(encode(&img, ImageFormat::Jpeg, 0).is_ok());
        assert!(encode(&img, ImageFormat::Jpeg, 255).is_ok());
    }

    #[test]
    fn fallback_when_nothing_gained() {
        // Same size, no resize, storage optimization off: reference original.
        assert!(!should_upload(100, 100, false, false));
        assert!(should_upload(99, 100, false, false));
        assert!(should_upload(100, 100, true, false));
        assert!(should_upload(100, 100, false, true));
    }

    #[test]
    fn store_transport_errors_are_transient() {
        let err = ProcessorError::Store(ObjectStoreError::Transport("timeout".into()));
        assert!(!err.is_permanent());
    }

    #[test]
    fn missing_original_is_permanent() {
        let err = ProcessorError::Store(ObjectStoreError::NotFound("id/a.jpg".into()));
        assert!(err.is_permanent());
    }
}
