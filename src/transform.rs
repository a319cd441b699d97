use crate::size::Size;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageError};
use std::fmt;
use std::str::FromStr;

/// Quality used for every JPEG derivative.
pub const JPEG_QUALITY: u8 = 80;

/// Largest width or height a derivative may be resampled to.
pub const DEFAULT_MAX_DIMENSION: u32 = 8192;

/// Catmull-Rom is the bicubic kernel offered by `image`.
const RESAMPLE: FilterType = FilterType::CatmullRom;

/// How a source is fitted into a box whose aspect ratio differs from its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CropMode {
    /// Scale to cover the box, then crop the overflow around the centre.
    #[default]
    Center,
    /// Stretch to the exact box without cropping.
    None,
}

impl FromStr for CropMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "center" | "centre" => Ok(CropMode::Center),
            "none" | "stretch" => Ok(CropMode::None),
            _ => Err(format!("Invalid crop mode: {}", s)),
        }
    }
}

impl fmt::Display for CropMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CropMode::Center => write!(f, "center"),
            CropMode::None => write!(f, "none"),
        }
    }
}

/// Encoded derivative produced by a [`Transformer`].
#[derive(Debug, Clone)]
pub struct Transformed {
    pub data: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The input is not an image this engine recognizes. Attributable to the
    /// client, which pointed us at it.
    #[error("unrecognized image format: {0}")]
    Undecodable(String),
    #[error("transform failed: {0}")]
    Failed(String),
    /// The requested box, once resolved against the source, is larger than
    /// the engine allows.
    #[error("output {width}x{height} exceeds {max}px")]
    TooLarge { width: u32, height: u32, max: u32 },
}

/// Image transform engine.
///
/// Implementations are CPU-bound and synchronous; callers run them on the
/// blocking pool.
pub trait Transformer: Send + Sync {
    fn transform(&self, raw: &[u8], size: Size, crop: CropMode) -> Result<Transformed, TransformError>;
}

/// Default engine: decode with `image`, resample, encode baseline JPEG.
#[derive(Debug, Clone)]
pub struct JpegTransformer {
    quality: u8,
    max_dimension: u32,
}

impl Default for JpegTransformer {
    fn default() -> Self {
        Self { quality: JPEG_QUALITY, max_dimension: DEFAULT_MAX_DIMENSION }
    }
}

impl JpegTransformer {
    pub fn with_max_dimension(mut self, max: u32) -> Self {
        self.max_dimension = max;
        self
    }
}

impl Transformer for JpegTransformer {
    fn transform(&self, raw: &[u8], size: Size, crop: CropMode) -> Result<Transformed, TransformError> {
        let img = decode_image(raw)?;
        if size.width != 0 || size.height != 0 {
            let (width, height) = output_dimensions(img.dimensions(), size);
            if width > self.max_dimension || height > self.max_dimension {
                return Err(TransformError::TooLarge { width, height, max: self.max_dimension });
            }
        }
        let resized = resize_image(img, size, crop);
        let data = encode_jpeg(&resized, self.quality)?;
        Ok(Transformed { data, content_type: mime::IMAGE_JPEG.to_string() })
    }
}

/// Decodes raw bytes after sniffing the format from magic bytes.
///
/// Anything the decoder does not recognize, or cannot parse, is reported as
/// [`TransformError::Undecodable`].
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, TransformError> {
    let guessed = image::guess_format(bytes)
        .map_err(|e| TransformError::Undecodable(e.to_string()))?;

    image::load_from_memory_with_format(bytes, guessed).map_err(|e| match e {
        // reading from memory only fails with an I/O error on truncated input
        ImageError::Decoding(_) | ImageError::Unsupported(_) | ImageError::IoError(_) => {
            TransformError::Undecodable(e.to_string())
        }
        other => TransformError::Failed(other.to_string()),
    })
}

/// Fits `img` into `size`.
///
/// - Both dimensions zero: the source is returned unchanged.
/// - One dimension zero: the other is derived from the source aspect ratio.
/// - Both set: [`CropMode`] decides between cover-and-crop and stretch.
///
/// Computed dimensions are clamped to at least one pixel.
pub fn resize_image(img: DynamicImage, size: Size, crop: CropMode) -> DynamicImage {
    let Size { width, height } = size;
    if width == 0 && height == 0 {
        return img;
    }

    if width == 0 || height == 0 {
        let (target_w, target_h) = output_dimensions(img.dimensions(), size);
        return img.resize_exact(target_w, target_h, RESAMPLE);
    }

    match crop {
        CropMode::Center => img.resize_to_fill(width, height, RESAMPLE),
        CropMode::None => img.resize_exact(width, height, RESAMPLE),
    }
}

/// Output box for a source of `(orig_w, orig_h)`: a zero dimension is
/// derived from the source aspect ratio, clamped to at least one pixel.
/// Both zero yields the source dimensions.
pub fn output_dimensions((orig_w, orig_h): (u32, u32), size: Size) -> (u32, u32) {
    let Size { width, height } = size;
    match (width, height) {
        (0, 0) => (orig_w, orig_h),
        (0, h) => (scale(orig_w, h, orig_h), h),
        (w, 0) => (w, scale(orig_h, w, orig_w)),
        (w, h) => (w, h),
    }
}

fn scale(side: u32, num: u32, den: u32) -> u32 {
    let v = (side as f64 * num as f64 / den.max(1) as f64).round();
    // the float-to-int cast saturates at u32::MAX
    (v as u32).max(1)
}

/// Encodes to baseline JPEG. Alpha is dropped since JPEG cannot carry it.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let enc = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    enc.write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
        .map_err(|e| TransformError::Failed(e.to_string()))?;
    Ok(out)
}
