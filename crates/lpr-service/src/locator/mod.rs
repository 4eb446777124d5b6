pub mod contour;

use crate::capability::ObjectDetector;
use crate::config::{LocatorStrategy, PipelineConfig};
use crate::frame::Frame;
use anyhow::{Context, Result};
use common::plates::{Detection, DetectionLabel};
use std::sync::Arc;

pub use contour::ContourLocator;

/// Learned plate locator: a single-class object detector
#[derive(Clone)]
pub struct ModelLocator {
    detector: Arc<dyn ObjectDetector>,
    threshold: f32,
}

impl ModelLocator {
    pub fn new(detector: Arc<dyn ObjectDetector>, threshold: f32) -> Self {
        Self {
            detector,
            threshold,
        }
    }

    pub fn locate(&self, crop: &Frame) -> Result<Vec<Detection>> {
        self.detector
            .detect(crop, self.threshold, &[DetectionLabel::PlateRegion])
            .with_context(|| format!("{} plate detection failed", self.detector.id()))
    }
}

/// Plate-region search strategy used inside each vehicle crop
#[derive(Clone)]
pub enum PlateLocator {
    Traditional(ContourLocator),
    Model(ModelLocator),
}

impl PlateLocator {
    /// Build the strategy selected by `config.locator_strategy`.
    ///
    /// The model strategy needs a plate detector; asking for it without one is a configuration error.
    pub fn from_config(
        config: &PipelineConfig,
        plate_detector: Option<Arc<dyn ObjectDetector>>,
    ) -> Result<Self> {
        match config.locator_strategy {
            LocatorStrategy::Traditional => {
                Ok(PlateLocator::Traditional(ContourLocator::from_config(config)))
            }
            LocatorStrategy::Model => {
                let detector = plate_detector
                    .context("locator_strategy \"model\" requires a plate detector")?;
                Ok(PlateLocator::Model(ModelLocator::new(
                    detector,
                    config.plate_detection_threshold,
                )))
            }
        }
    }

    /// Identifier used in logs and errors
    pub fn id(&self) -> &str {
        match self {
            PlateLocator::Traditional(_) => "contour_locator",
            PlateLocator::Model(model) => model.detector.id(),
        }
    }

    /// Candidate plate regions in `crop` coordinates. An empty result is not an error.
    pub fn locate(&self, crop: &Frame) -> Result<Vec<Detection>> {
        match self {
            PlateLocator::Traditional(contours) => Ok(contours.locate(crop)),
            PlateLocator::Model(model) => model.locate(crop),
        }
    }
}
