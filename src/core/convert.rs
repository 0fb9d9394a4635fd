use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub strategy: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Could not read image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Could not convert image: {}", summarize(.attempts))]
    Exhausted { attempts: Vec<AttemptFailure> },
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no conversion strategies configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.strategy, a.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One encode attempt.
pub trait ConversionStrategy: Send + Sync {
    fn name(&self) -> String;

    fn mime(&self) -> &'static str;

    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>, image::ImageError>;
}

pub struct JpegStrategy {
    pub quality: u8,
}

impl ConversionStrategy for JpegStrategy {
    fn name(&self) -> String {
        format!("jpeg-q{}", self.quality)
    }

    fn mime(&self) -> &'static str {
        "image/jpeg"
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
        // JPEG has no alpha channel.
        let rgb = image.to_rgb8();
        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, self.quality);
        rgb.write_with_encoder(encoder)?;
        Ok(out)
    }
}

pub struct PngStrategy;

impl ConversionStrategy for PngStrategy {
    fn name(&self) -> String {
        "png".to_string()
    }

    fn mime(&self) -> &'static str {
        "image/png"
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

#[derive(Clone)]
pub struct Converted {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub strategy: String,
    pub width: u32,
    pub height: u32,
    /// The decoded, resized image the bytes were encoded from.
    pub image: DynamicImage,
}

impl fmt::Debug for Converted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converted")
            .field("bytes", &self.bytes.len())
            .field("mime", &self.mime)
            .field("strategy", &self.strategy)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Decode once, downscale, then try each encoder in order; first success wins.
pub struct ConversionChain {
    strategies: Vec<Box<dyn ConversionStrategy>>,
    max_dimension: Option<u32>,
    max_encoded_bytes: Option<usize>,
}

impl ConversionChain {
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
            max_dimension: None,
            max_encoded_bytes: None,
        }
    }

    /// JPEG at each quality in turn, then lossless PNG.
    pub fn standard(jpeg_qualities: &[u8]) -> Self {
        let chain = jpeg_qualities
            .iter()
            .fold(Self::empty(), |chain, &quality| {
                chain.with_strategy(JpegStrategy { quality })
            });
        chain.with_strategy(PngStrategy)
    }

    pub fn with_strategy(mut self, strategy: impl ConversionStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = Some(max_dimension);
        self
    }

    /// Outputs larger than this count as a failed attempt.
    pub fn with_max_encoded_bytes(mut self, limit: usize) -> Self {
        self.max_encoded_bytes = Some(limit);
        self
    }

    pub fn convert(&self, bytes: &[u8]) -> Result<Converted, ConversionError> {
        let image = image::load_from_memory(bytes)?;
        let image = match self.max_dimension {
            Some(max) => downscale(image, max),
            None => image,
        };
        self.convert_image(image)
    }

    pub fn convert_image(&self, image: DynamicImage) -> Result<Converted, ConversionError> {
        let (width, height) = image.dimensions();
        let mut attempts = Vec::new();

        for strategy in &self.strategies {
            let reason = match strategy.encode(&image) {
                Ok(encoded) => match self.max_encoded_bytes {
                    Some(limit) if encoded.len() > limit => {
                        format!("{} bytes exceeds limit of {}", encoded.len(), limit)
                    }
                    _ => {
                        log::debug!(
                            "Converted {}x{} image with {} ({} bytes)",
                            width,
                            height,
                            strategy.name(),
                            encoded.len()
                        );
                        return Ok(Converted {
                            bytes: encoded,
                            mime: strategy.mime(),
                            strategy: strategy.name(),
                            width,
                            height,
                            image,
                        });
                    }
                },
                Err(e) => e.to_string(),
            };
            log::debug!("Conversion with {} failed: {}", strategy.name(), reason);
            attempts.push(AttemptFailure {
                strategy: strategy.name(),
                reason,
            });
        }

        Err(ConversionError::Exhausted { attempts })
    }
}

/// Shrink so the longer side is at most `max`, keeping aspect ratio. Smaller images pass through.
pub fn downscale(image: DynamicImage, max: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max && height <= max {
        return image;
    }

    let (new_width, new_height) = if width > height {
        let ratio = max as f32 / width as f32;
        (max, ((height as f32 * ratio) as u32).max(1))
    } else {
        let ratio = max as f32 / height as f32;
        (((width as f32 * ratio) as u32).max(1), max)
    };

    image.resize_exact(new_width, new_height, FilterType::Lanczos3)
}
