use super::{annotate, Detection, DetectionError, DetectionResult, Detector};
use crate::config::ModelConfig;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{Array4, ArrayViewD, Ix3};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info, instrument};

/// COCO dataset class names
pub const COCO_NAMES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

const STRIDE: u32 = 32;
const PAD_VALUE: u8 = 114;

/// YOLO detector running on ONNX Runtime.
///
/// Accepts both YOLOv5 exports (`[1, N, 5 + C]`, with objectness) and
/// YOLOv8 exports (`[1, 4 + C, N]`).
pub struct YoloDetector {
    /// `Session::run` needs `&mut`, so calls are serialized
    session: Mutex<Session>,
    input_name: String,
    name: String,
    labels: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl std::fmt::Debug for YoloDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoloDetector")
            .field("name", &self.name)
            .field("input_name", &self.input_name)
            .field("labels", &self.labels.len())
            .field("confidence_threshold", &self.confidence_threshold)
            .field("iou_threshold", &self.iou_threshold)
            .finish_non_exhaustive()
    }
}

impl YoloDetector {
    /// Load the model and labels described by `config`
    pub fn load(config: &ModelConfig) -> Result<Self, DetectionError> {
        if !config.path.exists() {
            return Err(DetectionError::Model(format!(
                "model not found: {}",
                config.path.display()
            )));
        }

        info!(path = %config.path.display(), "Loading detection model");

        let session = Session::builder()
            .map_err(model_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_error)?
            .with_intra_threads(config.intra_threads)
            .map_err(model_error)?
            .commit_from_file(&config.path)
            .map_err(model_error)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "images".to_string());

        let labels = load_labels(config.labels_path.as_deref())?;
        let name = config
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("yolo")
            .to_string();

        info!(
            model = %name,
            input = %input_name,
            classes = labels.len(),
            "Detection model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            name,
            labels,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        })
    }

    fn label(&self, class: usize) -> String {
        self.labels
            .get(class)
            .cloned()
            .unwrap_or_else(|| class.to_string())
    }
}

impl Detector for YoloDetector {
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    fn detect(
        &self,
        image: &DynamicImage,
        resolution: u32,
    ) -> Result<DetectionResult, DetectionError> {
        let Letterbox { tensor, transform } = letterbox(image, resolution);

        let candidates = {
            let tensor = Value::from_array(tensor)
                .map_err(|e| DetectionError::Inference(e.to_string()))?;

            let mut session = self.session.lock();
            let outputs = session
                .run(ort::inputs![self.input_name.as_str() => tensor])
                .map_err(|e| DetectionError::Inference(e.to_string()))?;

            let output = outputs[0]
                .try_extract_array::<f32>()
                .map_err(|e| DetectionError::Inference(e.to_string()))?;

            decode_output(&output, self.labels.len(), self.confidence_threshold)?
        };

        let kept = non_max_suppression(candidates, self.iou_threshold, self.max_detections);
        debug!(detections = kept.len(), "Inference complete");

        let (width, height) = (image.width() as f32, image.height() as f32);
        let detections: Vec<Detection> = kept
            .into_iter()
            .map(|c| {
                let [x1, y1, x2, y2] = transform.to_source(c.bbox, width, height);
                Detection {
                    xmin: x1,
                    ymin: y1,
                    xmax: x2,
                    ymax: y2,
                    confidence: c.score,
                    class: c.class as u32,
                    name: self.label(c.class),
                }
            })
            .collect();

        let annotated = annotate(image, &detections);
        Ok(DetectionResult::new(detections, Some(annotated)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn model_error<E: std::fmt::Display>(e: E) -> DetectionError {
    DetectionError::Model(e.to_string())
}

/// Class names from a file with one label per line, or the COCO names
pub fn load_labels(path: Option<&Path>) -> Result<Vec<String>, DetectionError> {
    let Some(path) = path else {
        return Ok(COCO_NAMES.iter().map(|s| s.to_string()).collect());
    };

    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// A letterboxed NCHW input plus the transform back to source pixels
struct Letterbox {
    tensor: Array4<f32>,
    transform: Transform,
}

#[derive(Debug, Clone, Copy)]
struct Transform {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Transform {
    fn to_source(&self, bbox: [f32; 4], width: f32, height: f32) -> [f32; 4] {
        let [x1, y1, x2, y2] = bbox;
        [
            ((x1 - self.pad_x) / self.scale).clamp(0.0, width),
            ((y1 - self.pad_y) / self.scale).clamp(0.0, height),
            ((x2 - self.pad_x) / self.scale).clamp(0.0, width),
            ((y2 - self.pad_y) / self.scale).clamp(0.0, height),
        ]
    }
}

/// Square model input size for a resolution hint
fn input_size(resolution: u32) -> u32 {
    resolution.max(1).div_ceil(STRIDE) * STRIDE
}

fn letterbox(image: &DynamicImage, resolution: u32) -> Letterbox {
    let size = input_size(resolution);
    let rgb = image.to_rgb8();
    let (w, h) = rgb.dimensions();

    let scale = (size as f32 / w.max(1) as f32).min(size as f32 / h.max(1) as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
    imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }

    Letterbox {
        tensor,
        transform: Transform {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    }
}

/// A scored box in model input coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    bbox: [f32; 4],
    score: f32,
    class: usize,
}

/// Decode raw YOLO output into candidates above `threshold`
fn decode_output(
    output: &ArrayViewD<f32>,
    classes: usize,
    threshold: f32,
) -> Result<Vec<Candidate>, DetectionError> {
    let shape = output.shape().to_vec();
    if shape.len() != 3 || shape[0] != 1 {
        return Err(DetectionError::OutputShape(shape));
    }
    let output = output
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| DetectionError::OutputShape(shape.clone()))?;

    // YOLOv8 puts attributes first. The attribute count identifies the
    // layout; the anchor/attribute ratio is only a fallback for label files
    // that do not match the model.
    let transposed = if shape[2] == classes + 5 {
        false
    } else if shape[1] == classes + 4 {
        true
    } else {
        shape[1] < shape[2]
    };
    let (anchors, attrs) = if transposed {
        (shape[2], shape[1])
    } else {
        (shape[1], shape[2])
    };
    let has_objectness = !transposed;
    let first_class = if has_objectness { 5 } else { 4 };
    if attrs <= first_class {
        return Err(DetectionError::OutputShape(shape));
    }

    let at = |anchor: usize, attr: usize| -> f32 {
        if transposed {
            output[[0, attr, anchor]]
        } else {
            output[[0, anchor, attr]]
        }
    };

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let objectness = if has_objectness { at(anchor, 4) } else { 1.0 };
        if objectness < threshold {
            continue;
        }

        let (class, class_score) = (first_class..attrs)
            .map(|attr| (attr - first_class, at(anchor, attr)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        let score = objectness * class_score;
        if score < threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(anchor, 0), at(anchor, 1), at(anchor, 2), at(anchor, 3));
        candidates.push(Candidate {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
            class,
        });
    }

    Ok(candidates)
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy per-class NMS, highest score first, capped at `max_detections`
fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|k| k.class == candidate.class && iou(&k.bbox, &candidate.bbox) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn candidate(bbox: [f32; 4], score: f32, class: usize) -> Candidate {
        Candidate { bbox, score, class }
    }

    #[test]
    fn test_input_size_rounds_to_stride() {
        assert_eq!(input_size(320), 320);
        assert_eq!(input_size(321), 352);
        assert_eq!(input_size(1), 32);
        assert_eq!(input_size(0), 32);
    }

    #[test]
    fn test_letterbox_wide_image() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 32, Rgb([255, 0, 0])));
        let lb = letterbox(&image, 64);

        assert_eq!(lb.tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(lb.transform.scale, 1.0);
        assert_eq!(lb.transform.pad_x, 0.0);
        assert_eq!(lb.transform.pad_y, 16.0);

        // Padding rows are grey, content rows carry the image
        let grey = PAD_VALUE as f32 / 255.0;
        assert_eq!(lb.tensor[[0, 0, 0, 0]], grey);
        assert_eq!(lb.tensor[[0, 0, 32, 10]], 1.0);
        assert_eq!(lb.tensor[[0, 1, 32, 10]], 0.0);
    }

    #[test]
    fn test_letterbox_maps_back_to_source() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(200, 100));
        let lb = letterbox(&image, 96);

        // 200x100 -> 96x48 inside a 96 square, padded by 24 rows
        assert_eq!(lb.transform.pad_y, 24.0);
        let back = lb.transform.to_source([0.0, 24.0, 96.0, 72.0], 200.0, 100.0);
        assert!((back[0] - 0.0).abs() < 1e-3);
        assert!((back[1] - 0.0).abs() < 1e-3);
        assert!((back[2] - 200.0).abs() < 1e-3);
        assert!((back[3] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        let half = iou(&a, &[5.0, 0.0, 15.0, 10.0]);
        assert!((half - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_is_per_class() {
        let boxes = vec![
            candidate([0.0, 0.0, 10.0, 10.0], 0.9, 0),
            candidate([1.0, 1.0, 10.0, 10.0], 0.8, 0),
            candidate([1.0, 1.0, 10.0, 10.0], 0.7, 1),
            candidate([50.0, 50.0, 60.0, 60.0], 0.6, 0),
        ];
        let kept = non_max_suppression(boxes, 0.45, 100);
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.6]);
    }

    #[test]
    fn test_nms_caps_detections() {
        let boxes = (0..10)
            .map(|i| candidate([i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0], 0.5, 0))
            .collect();
        assert_eq!(non_max_suppression(boxes, 0.45, 3).len(), 3);
    }

    #[test]
    fn test_decode_v5_layout() {
        // 10 anchors x (5 + 2 classes)
        let mut data = vec![0.0f32; 10 * 7];
        data[0..7].copy_from_slice(&[20.0, 20.0, 10.0, 10.0, 0.9, 0.1, 0.8]);
        data[7..14].copy_from_slice(&[40.0, 40.0, 10.0, 10.0, 0.1, 0.9, 0.9]);
        let output = ArrayD::from_shape_vec(IxDyn(&[1, 10, 7]), data).unwrap();

        let candidates = decode_output(&output.view(), 2, 0.25).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class, 1);
        assert_eq!(candidates[0].bbox, [15.0, 15.0, 25.0, 25.0]);
        assert!((candidates[0].score - 0.72).abs() < 1e-6);
    }

    #[test]
    fn test_decode_v8_layout() {
        // (4 + 2 classes) x 8 anchors
        let (attrs, anchors) = (6, 8);
        let mut data = vec![0.0f32; attrs * anchors];
        let mut set = |attr: usize, anchor: usize, v: f32| data[attr * anchors + anchor] = v;
        set(0, 3, 30.0);
        set(1, 3, 30.0);
        set(2, 3, 20.0);
        set(3, 3, 10.0);
        set(4, 3, 0.2);
        set(5, 3, 0.6);
        let output = ArrayD::from_shape_vec(IxDyn(&[1, attrs, anchors]), data).unwrap();

        let candidates = decode_output(&output.view(), 2, 0.25).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class, 1);
        assert_eq!(candidates[0].bbox, [20.0, 25.0, 40.0, 35.0]);
        assert_eq!(candidates[0].score, 0.6);
    }

    #[test]
    fn test_decode_v5_with_few_anchors() {
        // Small inputs yield fewer anchors than attributes
        let mut data = vec![0.0f32; 6 * 7];
        data[0..7].copy_from_slice(&[20.0, 20.0, 10.0, 10.0, 0.9, 0.1, 0.8]);
        let output = ArrayD::from_shape_vec(IxDyn(&[1, 6, 7]), data).unwrap();

        let candidates = decode_output(&output.view(), 2, 0.25).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class, 1);
        assert_eq!(candidates[0].bbox, [15.0, 15.0, 25.0, 25.0]);
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let output = ArrayD::<f32>::zeros(IxDyn(&[2, 3]));
        assert!(matches!(
            decode_output(&output.view(), 2, 0.25),
            Err(DetectionError::OutputShape(_))
        ));
    }

    #[test]
    fn test_labels_default_to_coco() {
        let labels = load_labels(None).unwrap();
        assert_eq!(labels.len(), 80);
        assert_eq!(labels[16], "dog");
    }

    #[test]
    fn test_labels_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "cat\n\n dog \nbird\n").unwrap();
        assert_eq!(load_labels(Some(&path)).unwrap(), vec!["cat", "dog", "bird"]);
    }
}
