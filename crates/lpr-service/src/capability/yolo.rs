//! YOLOv8 object detection backed by ONNX Runtime.
//!
//! One type serves both as the vehicle detector (COCO model) and as the learned
//! plate locator (single-class plate model); class names decide which labels it reports.

use super::session::{self, ExecutionConfig};
use super::ObjectDetector;
use crate::frame::Frame;
use anyhow::{Context, Result};
use common::plates::{BoundingBox, Detection, DetectionLabel};
use ndarray::{Array, IxDyn};
use ort::{session::Session, value::Value};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

const OUTPUT_NAMES: [&str; 3] = ["output0", "output", "boxes"];

const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
    "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
    "toothbrush",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoloConfig {
    /// Path to the ONNX model file
    pub model_path: PathBuf,

    /// Class names by model output index. Empty means COCO names for multi-class
    /// models and `license_plate` for single-class models.
    #[serde(default)]
    pub class_names: Vec<String>,

    /// IoU (Intersection over Union) threshold for NMS
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Maximum number of detections per frame
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,

    /// Model input size (width and height)
    #[serde(default = "default_input_size")]
    pub input_size: u32,
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_max_detections() -> usize {
    100
}

fn default_input_size() -> u32 {
    640
}

impl YoloConfig {
    pub fn vehicle_default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolov8n.onnx"),
            class_names: Vec::new(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
            input_size: default_input_size(),
        }
    }

    pub fn plate_default() -> Self {
        Self {
            model_path: PathBuf::from("models/license-plate-finetune-v1n.onnx"),
            class_names: vec!["license_plate".to_string()],
            iou_threshold: default_iou_threshold(),
            max_detections: 20,
            input_size: default_input_size(),
        }
    }

    /// Label for a model output index, `None` for classes the pipeline ignores
    fn label_for(&self, class_idx: usize, num_classes: usize) -> Option<DetectionLabel> {
        let name = if !self.class_names.is_empty() {
            self.class_names.get(class_idx).map(String::as_str)
        } else if num_classes == 1 {
            Some("license_plate")
        } else {
            COCO_CLASSES.get(class_idx).copied()
        }?;
        DetectionLabel::from_class_name(name)
    }
}

/// YOLOv8 detector holding one ONNX session
pub struct YoloDetector {
    id: String,
    config: YoloConfig,
    session: Mutex<Session>,
    execution_provider: String,
}

impl YoloDetector {
    /// Load the model at `config.model_path`
    pub fn load(id: impl Into<String>, config: YoloConfig, execution: &ExecutionConfig) -> Result<Self> {
        let id = id.into();
        let (session, execution_provider) = session::create_session(&config.model_path, execution)
            .with_context(|| format!("Failed to load {} model", id))?;

        tracing::info!(
            capability = %id,
            model = %config.model_path.display(),
            provider = %execution_provider,
            device_id = execution.device_id,
            "initialized YOLOv8 detector"
        );

        Ok(Self {
            id,
            config,
            session: Mutex::new(session),
            execution_provider,
        })
    }

    pub fn execution_provider(&self) -> &str {
        &self.execution_provider
    }

    /// Resize to the model input and convert to NCHW normalized to [0, 1]
    fn preprocess(&self, frame: &Frame) -> Array<f32, IxDyn> {
        let size = self.config.input_size;
        let resized = image::imageops::resize(
            frame.pixels(),
            size,
            size,
            image::imageops::FilterType::Triangle,
        );

        let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
        for (x, y, pixel) in resized.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
            input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
            input[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
        }
        input
    }
}

impl ObjectDetector for YoloDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn detect(
        &self,
        frame: &Frame,
        confidence_threshold: f32,
        allowed: &[DetectionLabel],
    ) -> Result<Vec<Detection>> {
        let input_tensor = Value::from_array(self.preprocess(frame))?;

        let inference_start = Instant::now();
        let output = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| anyhow::anyhow!("Failed to lock {} session: {}", self.id, e))?;
            let outputs = session.run(ort::inputs![input_tensor])?;
            let output_value = OUTPUT_NAMES
                .iter()
                .find_map(|name| outputs.get(*name))
                .with_context(|| {
                    format!("No detection output tensor found (tried: {})", OUTPUT_NAMES.join(", "))
                })?;
            session::to_array(output_value)?
        };

        telemetry::metrics::LPR_INFERENCE_DURATION
            .with_label_values(&[self.id.as_str(), self.execution_provider.as_str()])
            .observe(inference_start.elapsed().as_secs_f64());

        decode_predictions(
            &output,
            &self.config,
            frame.width(),
            frame.height(),
            confidence_threshold,
            allowed,
        )
    }
}

/// Turn a YOLOv8 output `[1, 4 + classes, N]` into frame-space detections
pub(crate) fn decode_predictions(
    output: &Array<f32, IxDyn>,
    config: &YoloConfig,
    frame_width: u32,
    frame_height: u32,
    confidence_threshold: f32,
    allowed: &[DetectionLabel],
) -> Result<Vec<Detection>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
        anyhow::bail!("Unexpected YOLOv8 output shape {:?}", shape);
    }
    let num_classes = shape[1] - 4;
    let num_predictions = shape[2];

    let scale_x = frame_width as f32 / config.input_size as f32;
    let scale_y = frame_height as f32 / config.input_size as f32;

    let mut candidates = Vec::new();
    for i in 0..num_predictions {
        let mut best_score = f32::MIN;
        let mut best_class = 0;
        for class_idx in 0..num_classes {
            let score = output[[0, 4 + class_idx, i]];
            if score > best_score {
                best_score = score;
                best_class = class_idx;
            }
        }

        if !best_score.is_finite() || best_score < confidence_threshold {
            continue;
        }
        let Some(label) = config.label_for(best_class, num_classes) else {
            continue;
        };
        if !allowed.contains(&label) {
            continue;
        }

        let cx = output[[0, 0, i]];
        let cy = output[[0, 1, i]];
        let w = output[[0, 2, i]];
        let h = output[[0, 3, i]];

        let bbox = BoundingBox::from_corners(
            (cx - w / 2.0) * scale_x,
            (cy - h / 2.0) * scale_y,
            (cx + w / 2.0) * scale_x,
            (cy + h / 2.0) * scale_y,
        );
        let Some(bbox) = bbox.clip_to(frame_width, frame_height) else {
            continue;
        };

        candidates.push(Detection::new(label, best_score.min(1.0), bbox));
    }

    let mut kept = nms(candidates, config.iou_threshold);
    kept.truncate(config.max_detections);
    Ok(kept)
}

/// Class-agnostic Non-Maximum Suppression, highest confidence first
pub(crate) fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for detection in detections {
        if keep
            .iter()
            .all(|kept| kept.bbox.iou(&detection.bbox) < iou_threshold)
        {
            keep.push(detection);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::plates::VehicleClass;

    const CAR: DetectionLabel = DetectionLabel::Vehicle(VehicleClass::Car);
    const TRUCK: DetectionLabel = DetectionLabel::Vehicle(VehicleClass::Truck);

    /// Build a `[1, 4 + classes, N]` tensor from (cx, cy, w, h, scores) rows
    fn yolo_output(rows: &[(f32, f32, f32, f32, Vec<f32>)]) -> Array<f32, IxDyn> {
        let classes = rows[0].4.len();
        let mut output = Array::zeros(IxDyn(&[1, 4 + classes, rows.len()]));
        for (i, (cx, cy, w, h, scores)) in rows.iter().enumerate() {
            output[[0, 0, i]] = *cx;
            output[[0, 1, i]] = *cy;
            output[[0, 2, i]] = *w;
            output[[0, 3, i]] = *h;
            for (c, score) in scores.iter().enumerate() {
                output[[0, 4 + c, i]] = *score;
            }
        }
        output
    }

    fn coco_scores(class_idx: usize, score: f32) -> Vec<f32> {
        let mut scores = vec![0.0; 80];
        scores[class_idx] = score;
        scores
    }

    #[test]
    fn test_config_defaults() {
        let config = YoloConfig::vehicle_default();
        assert_eq!(config.iou_threshold, 0.45);
        assert_eq!(config.max_detections, 100);
        assert_eq!(config.input_size, 640);
        assert!(config.class_names.is_empty());
    }

    #[test]
    fn test_label_mapping() {
        let vehicles = YoloConfig::vehicle_default();
        assert_eq!(vehicles.label_for(2, 80), Some(CAR));
        assert_eq!(vehicles.label_for(7, 80), Some(TRUCK));
        assert_eq!(vehicles.label_for(0, 80), None);
        assert_eq!(vehicles.label_for(0, 1), Some(DetectionLabel::PlateRegion));

        let plates = YoloConfig::plate_default();
        assert_eq!(plates.label_for(0, 1), Some(DetectionLabel::PlateRegion));
        assert_eq!(plates.label_for(3, 1), None);
    }

    #[test]
    fn test_decode_scales_and_filters() {
        let config = YoloConfig::vehicle_default();
        let output = yolo_output(&[
            // Car centred in the input, half its size
            (320.0, 320.0, 320.0, 320.0, coco_scores(2, 0.9)),
            // Person: not a vehicle
            (100.0, 100.0, 50.0, 50.0, coco_scores(0, 0.95)),
            // Truck below threshold
            (500.0, 500.0, 100.0, 100.0, coco_scores(7, 0.3)),
        ]);

        let detections =
            decode_predictions(&output, &config, 1280, 960, 0.5, &[CAR, TRUCK]).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, CAR);
        assert_eq!(detections[0].bbox, BoundingBox::new(320, 240, 640, 480));
    }

    #[test]
    fn test_decode_respects_allowed_labels() {
        let config = YoloConfig::vehicle_default();
        let output = yolo_output(&[(320.0, 320.0, 100.0, 100.0, coco_scores(7, 0.8))]);

        let detections = decode_predictions(&output, &config, 640, 640, 0.5, &[CAR]).unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn test_decode_clips_to_frame() {
        let config = YoloConfig::plate_default();
        let output = yolo_output(&[(630.0, 10.0, 40.0, 40.0, vec![0.7])]);

        let detections =
            decode_predictions(&output, &config, 640, 640, 0.3, &[DetectionLabel::PlateRegion])
                .unwrap();
        assert_eq!(detections.len(), 1);
        assert!(detections[0].bbox.is_within(640, 640));
        assert_eq!(detections[0].bbox, BoundingBox::new(610, 0, 30, 30));
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let config = YoloConfig::vehicle_default();
        let output = Array::zeros(IxDyn(&[1, 3, 10]));
        assert!(decode_predictions(&output, &config, 640, 640, 0.5, &[CAR]).is_err());
    }

    #[test]
    fn test_nms() {
        let detections = vec![
            Detection::new(CAR, 0.9, BoundingBox::new(10, 10, 50, 20)),
            Detection::new(CAR, 0.8, BoundingBox::new(12, 12, 50, 20)),
            Detection::new(TRUCK, 0.7, BoundingBox::new(100, 100, 50, 20)),
        ];

        let filtered = nms(detections, 0.45);

        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].confidence, 0.9);
        assert_eq!(filtered[1].confidence, 0.7);
    }
}
