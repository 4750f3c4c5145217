//! Detection model adapter.
//!
//! A [`Detector`] turns one decoded image into a [`DetectionResult`]. The
//! result owns everything needed to persist the annotated image, so the
//! request handler never touches model internals.

mod annotate;
mod yolo;

pub use annotate::annotate;
pub use yolo::{load_labels, YoloDetector, COCO_NAMES};

use image::{DynamicImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to load model: {0}")]
    Model(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Unexpected model output shape: {0:?}")]
    OutputShape(Vec<usize>),

    #[error("No annotated image available")]
    MissingAnnotation,

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A pretrained object detector, loaded once and shared across requests
pub trait Detector: Send + Sync {
    /// Detect objects in `image`, using `resolution` as the inference size hint
    fn detect(&self, image: &DynamicImage, resolution: u32)
        -> Result<DetectionResult, DetectionError>;

    /// Model name for logs and health output
    fn name(&self) -> &str;
}

/// One detected object, in source image pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub confidence: f32,
    pub class: u32,
    pub name: String,
}

/// Detections for exactly one source image
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    detections: Vec<Detection>,
    annotated: Option<RgbImage>,
}

impl DetectionResult {
    /// Build a result; detections are ordered by descending confidence
    pub fn new(mut detections: Vec<Detection>, annotated: Option<RgbImage>) -> Self {
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Self {
            detections,
            annotated,
        }
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn into_detections(self) -> Vec<Detection> {
        self.detections
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn annotated(&self) -> Option<&RgbImage> {
        self.annotated.as_ref()
    }

    /// Encode the in-memory annotated image. Fails when the adapter did not
    /// supply one.
    pub fn encode_annotated(&self, format: ImageFormat) -> Result<Vec<u8>, DetectionError> {
        let annotated = self
            .annotated
            .as_ref()
            .ok_or(DetectionError::MissingAnnotation)?;

        let mut buf = Cursor::new(Vec::new());
        annotated.write_to(&mut buf, format)?;
        Ok(buf.into_inner())
    }

    /// Write the annotated image to `{dir}/{filename}`.
    ///
    /// Boxes are rendered onto `source` when no annotated image is held.
    pub fn save(
        &self,
        source: &DynamicImage,
        dir: &Path,
        filename: &str,
    ) -> Result<PathBuf, DetectionError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(filename);
        let (format, _) = output_format(filename);

        match self.annotated {
            Some(ref annotated) => annotated.save_with_format(&path, format)?,
            None => annotate(source, &self.detections).save_with_format(&path, format)?,
        }
        Ok(path)
    }
}

/// Image format and content type for an output filename. Unknown or missing
/// extensions fall back to JPEG.
pub fn output_format(filename: &str) -> (ImageFormat, &'static str) {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => (ImageFormat::Png, "image/png"),
        "webp" => (ImageFormat::WebP, "image/webp"),
        "bmp" => (ImageFormat::Bmp, "image/bmp"),
        "gif" => (ImageFormat::Gif, "image/gif"),
        _ => (ImageFormat::Jpeg, "image/jpeg"),
    }
}
