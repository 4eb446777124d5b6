//! Per-frame orchestration: vehicles, then plate regions, then text.
//!
//! A `PlatePipeline` holds only read-only configuration and shared capabilities,
//! so one instance can serve any number of concurrent runs.

use crate::assembler::{PipelineOutput, ResultAssembler};
use crate::capability::{ObjectDetector, OcrReading, TextRecognizer};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::locator::PlateLocator;
use crate::validator::PlateValidator;
use anyhow::Result;
use common::plates::{BoundingBox, Detection, DetectionLabel, RecognizedPlate};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics::{
    LPR_CANDIDATES_REJECTED, LPR_FRAMES_PROCESSED, LPR_PLATES_RECOGNIZED, LPR_STAGE_DURATION,
};
use tracing::{debug, info, warn};

/// A located plate region and what OCR made of one view of it. Lives for one run only.
#[derive(Debug, Clone)]
pub struct PlateCandidate {
    pub source_detection: Detection,
    pub crop: Frame,
    pub raw_text: String,
    pub ocr_confidence: f32,
}

impl PlateCandidate {
    fn new(source_detection: &Detection, crop: &Frame, reading: OcrReading) -> Self {
        Self {
            source_detection: source_detection.clone(),
            crop: crop.clone(),
            raw_text: reading.text,
            ocr_confidence: reading.confidence,
        }
    }
}

/// Region the plate search runs in, with its box in frame coordinates
struct SearchArea {
    crop: Frame,
    origin: BoundingBox,
    vehicle_box: Option<BoundingBox>,
}

pub struct PlatePipeline {
    config: Arc<PipelineConfig>,
    vehicle_detector: Arc<dyn ObjectDetector>,
    locator: PlateLocator,
    recognizer: Arc<dyn TextRecognizer>,
    validator: PlateValidator,
    assembler: ResultAssembler,
    allowed_vehicles: Vec<DetectionLabel>,
}

impl PlatePipeline {
    /// Validate `config` and wire the capabilities together.
    ///
    /// `plate_detector` is required when `config.locator_strategy` is `model`.
    pub fn new(
        config: Arc<PipelineConfig>,
        vehicle_detector: Arc<dyn ObjectDetector>,
        plate_detector: Option<Arc<dyn ObjectDetector>>,
        recognizer: Arc<dyn TextRecognizer>,
    ) -> Result<Self> {
        config.validate()?;

        let locator = PlateLocator::from_config(&config, plate_detector)?;
        let validator =
            PlateValidator::new(config.validation.clone(), config.plate_confidence_threshold);
        let allowed_vehicles = config
            .vehicle_classes
            .iter()
            .map(|class| DetectionLabel::Vehicle(*class))
            .collect();

        info!(
            vehicle_detector = vehicle_detector.id(),
            locator = locator.id(),
            recognizer = recognizer.id(),
            "Plate pipeline ready"
        );

        Ok(Self {
            config,
            vehicle_detector,
            locator,
            recognizer,
            validator,
            assembler: ResultAssembler::default(),
            allowed_vehicles,
        })
    }

    pub fn with_assembler(mut self, assembler: ResultAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage on `frame`. An empty `plates` list is a normal outcome.
    pub fn run(&self, frame: &Frame) -> Result<PipelineOutput, PipelineError> {
        let result = self.run_stages(frame);
        let outcome = match &result {
            Ok(output) if output.plates.is_empty() => "no_plate",
            Ok(_) => "plates_found",
            Err(_) => "error",
        };
        LPR_FRAMES_PROCESSED.with_label_values(&[outcome]).inc();
        result
    }

    fn run_stages(&self, frame: &Frame) -> Result<PipelineOutput, PipelineError> {
        let vehicles = timed("detect_vehicles", || self.detect_vehicles(frame))?;
        debug!(count = vehicles.len(), "Vehicles detected");

        let areas = self.search_areas(frame, &vehicles);

        let mut plates = Vec::new();
        for area in &areas {
            let regions = timed("locate", || self.locate(area))?;
            for region in regions {
                let candidates = timed("ocr", || self.read(area, region));
                if let Some(plate) = self.accept(area, candidates) {
                    plates.push(plate);
                }
            }
        }

        let plates = self.finalize(frame, plates);
        LPR_PLATES_RECOGNIZED.inc_by(plates.len() as u64);
        if !plates.is_empty() {
            info!(
                plates = ?plates.iter().map(|p| p.text.as_str()).collect::<Vec<_>>(),
                source = frame.source().unwrap_or("<memory>"),
                "Plates recognized"
            );
        }

        Ok(timed("assemble", || {
            self.assembler.assemble(frame, plates, vehicles)
        }))
    }

    /// Vehicle detections, re-checked against the threshold, classes and frame bounds
    fn detect_vehicles(&self, frame: &Frame) -> Result<Vec<Detection>, PipelineError> {
        let threshold = self.config.vehicle_confidence_threshold;
        let detections = self
            .vehicle_detector
            .detect(frame, threshold, &self.allowed_vehicles)
            .map_err(|e| PipelineError::detection_unavailable(self.vehicle_detector.id(), &e))?;

        Ok(enforce_contract(
            detections,
            threshold,
            &self.allowed_vehicles,
            frame,
        ))
    }

    fn search_areas(&self, frame: &Frame, vehicles: &[Detection]) -> Vec<SearchArea> {
        if vehicles.is_empty() {
            if self.config.full_frame_fallback {
                debug!("No vehicles, searching the full frame");
                return vec![SearchArea {
                    crop: frame.clone(),
                    origin: frame.bounds(),
                    vehicle_box: None,
                }];
            }
            return Vec::new();
        }

        vehicles
            .iter()
            .filter_map(|vehicle| {
                let crop = frame.crop(&vehicle.bbox)?;
                Some(SearchArea {
                    crop,
                    origin: vehicle.bbox,
                    vehicle_box: Some(vehicle.bbox),
                })
            })
            .collect()
    }

    fn locate(&self, area: &SearchArea) -> Result<Vec<Detection>, PipelineError> {
        let regions = self
            .locator
            .locate(&area.crop)
            .map_err(|e| PipelineError::detection_unavailable(self.locator.id(), &e))?;

        let threshold = match &self.locator {
            PlateLocator::Model(_) => self.config.plate_detection_threshold,
            PlateLocator::Traditional(_) => 0.0,
        };
        Ok(enforce_contract(
            regions,
            threshold,
            &[DetectionLabel::PlateRegion],
            &area.crop,
        ))
    }

    /// OCR one region, one candidate per recognizer view. A recognizer failure drops only this region.
    fn read(&self, area: &SearchArea, region: Detection) -> Vec<PlateCandidate> {
        let Some(crop) = area.crop.crop(&region.bbox) else {
            return Vec::new();
        };
        match self.recognizer.recognize_variants(&crop) {
            Ok(readings) => readings
                .into_iter()
                .map(|reading| PlateCandidate::new(&region, &crop, reading))
                .collect(),
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(
                    recognizer = self.recognizer.id(),
                    error = %error,
                    "OCR failed for plate candidate"
                );
                LPR_CANDIDATES_REJECTED.with_label_values(&["ocr_failed"]).inc();
                Vec::new()
            }
        }
    }

    /// Validate every view of a region and keep the longest accepted text.
    ///
    /// Higher confidence breaks length ties. A region with no accepted view is
    /// counted once, under the first view's rejection reason.
    fn accept(&self, area: &SearchArea, candidates: Vec<PlateCandidate>) -> Option<RecognizedPlate> {
        let mut best: Option<(String, PlateCandidate)> = None;
        let mut first_rejection = None;

        for candidate in candidates {
            match self
                .validator
                .validate(&candidate.raw_text, candidate.ocr_confidence)
            {
                Ok(text) => {
                    let better = best.as_ref().map_or(true, |(kept, kept_candidate)| {
                        (text.len(), candidate.ocr_confidence)
                            > (kept.len(), kept_candidate.ocr_confidence)
                    });
                    if better {
                        best = Some((text, candidate));
                    }
                }
                Err(rejection) => {
                    debug!(
                        raw_text = %candidate.raw_text,
                        confidence = candidate.ocr_confidence,
                        reason = rejection.reason(),
                        "Plate candidate rejected: {}",
                        rejection
                    );
                    first_rejection.get_or_insert(rejection);
                }
            }
        }

        match best {
            Some((text, candidate)) => Some(RecognizedPlate {
                text,
                confidence: candidate.ocr_confidence,
                bbox: candidate.source_detection.bbox.offset_by(&area.origin),
                vehicle_box: area.vehicle_box,
            }),
            None => {
                if let Some(rejection) = first_rejection {
                    LPR_CANDIDATES_REJECTED
                        .with_label_values(&[rejection.reason()])
                        .inc();
                }
                None
            }
        }
    }

    /// Bounds and confidence guard, then per-frame de-duplication
    fn finalize(&self, frame: &Frame, plates: Vec<RecognizedPlate>) -> Vec<RecognizedPlate> {
        let threshold = self.config.plate_confidence_threshold;
        let mut seen = HashSet::new();
        plates
            .into_iter()
            .filter(|plate| {
                let keep =
                    plate.bbox.is_within(frame.width(), frame.height()) && plate.confidence >= threshold;
                if !keep {
                    warn!(plate = %plate.text, "Dropping plate outside frame bounds or below threshold");
                }
                keep
            })
            .filter(|plate| !self.config.deduplicate || seen.insert(plate.text.clone()))
            .collect()
    }
}

/// Re-apply the detector contract regardless of which backend produced `detections`
fn enforce_contract(
    detections: Vec<Detection>,
    threshold: f32,
    allowed: &[DetectionLabel],
    frame: &Frame,
) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= threshold && allowed.contains(&d.label))
        .filter_map(|d| {
            let bbox = d.bbox.clip_to(frame.width(), frame.height())?;
            Some(Detection { bbox, ..d })
        })
        .collect()
}

fn timed<T>(stage: &str, f: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let value = f();
    LPR_STAGE_DURATION
        .with_label_values(&[stage])
        .observe(started.elapsed().as_secs_f64());
    value
}
