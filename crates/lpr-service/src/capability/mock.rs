//! Scripted capability doubles for tests and demonstration runs without models

use super::{ObjectDetector, OcrReading, TextRecognizer};
use crate::frame::Frame;
use anyhow::Result;
use common::plates::{Detection, DetectionLabel};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Detector that returns a fixed set of detections on every call
pub struct ScriptedDetector {
    id: String,
    detections: Vec<Detection>,
    failure: Option<String>,
    honour_contract: bool,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(id: impl Into<String>, detections: Vec<Detection>) -> Self {
        Self {
            id: id.into(),
            detections,
            failure: None,
            honour_contract: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Detector whose backend is down
    pub fn failing(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(id, Vec::new())
        }
    }

    /// Return the scripted detections as-is, ignoring threshold, labels and bounds
    pub fn unfiltered(mut self) -> Self {
        self.honour_contract = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ObjectDetector for ScriptedDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn detect(
        &self,
        frame: &Frame,
        confidence_threshold: f32,
        allowed: &[DetectionLabel],
    ) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            anyhow::bail!("{}", message);
        }
        if !self.honour_contract {
            return Ok(self.detections.clone());
        }

        Ok(self
            .detections
            .iter()
            .filter(|d| d.confidence >= confidence_threshold && allowed.contains(&d.label))
            .filter_map(|d| {
                d.bbox
                    .clip_to(frame.width(), frame.height())
                    .map(|bbox| Detection { bbox, ..d.clone() })
            })
            .collect())
    }
}

/// Recognizer that replays scripted readings in call order, wrapping around
pub struct ScriptedRecognizer {
    readings: Vec<OcrReading>,
    failure: Option<String>,
    all_variants: bool,
    calls: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn sequence(readings: Vec<OcrReading>) -> Self {
        Self {
            readings,
            failure: None,
            all_variants: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call reports all `readings` at once, as a multi-view backend would
    pub fn variants(readings: Vec<OcrReading>) -> Self {
        Self {
            all_variants: true,
            ..Self::sequence(readings)
        }
    }

    pub fn constant(text: impl Into<String>, confidence: f32) -> Self {
        Self::sequence(vec![OcrReading::new(text, confidence)])
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::sequence(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextRecognizer for ScriptedRecognizer {
    fn id(&self) -> &str {
        "scripted_ocr"
    }

    fn recognize(&self, _crop: &Frame) -> Result<OcrReading> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            anyhow::bail!("{}", message);
        }
        if self.readings.is_empty() {
            return Ok(OcrReading::empty());
        }
        Ok(self.readings[call % self.readings.len()].clone())
    }

    fn recognize_variants(&self, crop: &Frame) -> Result<Vec<OcrReading>> {
        if !self.all_variants {
            return Ok(vec![self.recognize(crop)?]);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            anyhow::bail!("{}", message);
        }
        Ok(self.readings.clone())
    }
}
