//! External recognition capabilities.
//!
//! The pipeline only knows these contracts; any backend that honours them
//! (ONNX models, a remote service, scripted test doubles) can be injected.

pub mod mock;
pub mod ocr;
pub mod session;
pub mod yolo;

use crate::frame::Frame;
use anyhow::Result;
use common::plates::{Detection, DetectionLabel};
use serde::{Deserialize, Serialize};

/// Object detection backend (vehicle detector or learned plate locator)
pub trait ObjectDetector: Send + Sync {
    /// Identifier used in logs and metrics (e.g., "yolov8")
    fn id(&self) -> &str;

    /// Detect objects with `confidence >= confidence_threshold` whose label is in `allowed`.
    ///
    /// Boxes are in `frame` coordinates. An `Err` means the backend itself failed,
    /// not that nothing was found.
    fn detect(
        &self,
        frame: &Frame,
        confidence_threshold: f32,
        allowed: &[DetectionLabel],
    ) -> Result<Vec<Detection>>;
}

/// Raw text read from a plate crop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrReading {
    pub text: String,
    pub confidence: f32,
}

impl OcrReading {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }

    /// "No text found" result
    pub fn empty() -> Self {
        Self::new("", 0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Text recognition backend
pub trait TextRecognizer: Send + Sync {
    fn id(&self) -> &str;

    /// Read the text in `crop`. Empty text with confidence 0 is a valid result.
    fn recognize(&self, crop: &Frame) -> Result<OcrReading>;

    /// One reading per preprocessed view of `crop`, in the backend's variant order.
    ///
    /// The caller picks among them; single-view backends return their `recognize` result.
    fn recognize_variants(&self, crop: &Frame) -> Result<Vec<OcrReading>> {
        Ok(vec![self.recognize(crop)?])
    }
}
