use crate::capability::ocr::OcrModelConfig;
use crate::capability::session::ExecutionConfig;
use crate::capability::yolo::YoloConfig;
use crate::validator::ValidationRules;
use anyhow::{Context, Result};
use common::plates::{CarEvent, VehicleClass};
use common::validation::{
    validate_duration_ms, validate_path_components, validate_range, validate_unit_interval,
    validate_uri,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn env_u32(key: &str, def: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(def)
}

fn env_u64(key: &str, def: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(def)
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

/// `path` appended to the path of `base`, keeping any prefix the base already has
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url> {
    if base.cannot_be_a_base() {
        anyhow::bail!("{} cannot carry an endpoint path", base);
    }
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    Ok(url)
}

/// Where and how the camera is fetched
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Camera base URL (e.g. the ESP32 at `http://192.168.5.32:81`)
    pub base_url: Url,

    /// Path of the still-capture endpoint
    pub capture_path: String,

    /// Per-request timeout
    pub fetch_timeout: Duration,

    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Fixed sleep between attempts
    pub retry_backoff: Duration,
}

impl CameraConfig {
    /// Camera at `base_url` with the default endpoint, timeout and retry budget
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            capture_path: "/capture".to_string(),
            fetch_timeout: Duration::from_millis(5000),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn capture_url(&self) -> Result<Url> {
        endpoint_url(&self.base_url, &self.capture_path)
            .with_context(|| format!("Invalid capture path {:?}", self.capture_path))
    }
}

/// Process-level settings, read once from the environment
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub camera: CameraConfig,

    /// Time between camera polls
    pub poll_interval: Duration,

    /// Upper bound on a single acquire-and-process cycle
    pub cycle_timeout: Duration,

    /// Directory for annotated diagnostic images
    pub output_dir: PathBuf,

    /// Base URL of the dashboard collaborator receiving plate records
    pub event_url: Option<Url>,

    /// Event reported with every record
    pub event: CarEvent,

    /// JSON file with pipeline and model settings
    pub pipeline_config_path: Option<PathBuf>,

    /// Node-exporter textfile the metrics are written to after each cycle
    pub metrics_textfile: Option<PathBuf>,

    /// TTF/OTF font replacing the embedded label font
    pub label_font: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let camera_url =
            env::var("LPR_CAMERA_URL").unwrap_or_else(|_| "http://192.168.5.32:81".to_string());
        validate_uri(&camera_url, "LPR_CAMERA_URL")?;
        let base_url = Url::parse(&camera_url).context("Invalid LPR_CAMERA_URL")?;

        let event_url = env::var("LPR_EVENT_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                validate_uri(&s, "LPR_EVENT_URL")?;
                Url::parse(&s).context("Invalid LPR_EVENT_URL")
            })
            .transpose()?;

        let event = match env::var("LPR_EVENT") {
            Ok(value) => value
                .parse::<CarEvent>()
                .map_err(anyhow::Error::msg)
                .context("Invalid LPR_EVENT")?,
            Err(_) => CarEvent::Enter,
        };

        let config = Self {
            camera: CameraConfig {
                base_url,
                capture_path: env::var("LPR_CAPTURE_PATH")
                    .unwrap_or_else(|_| "/capture".to_string()),
                fetch_timeout: Duration::from_millis(env_u64("LPR_FETCH_TIMEOUT_MS", 5000)),
                max_retries: env_u32("LPR_FETCH_RETRIES", 2),
                retry_backoff: Duration::from_millis(env_u64("LPR_FETCH_BACKOFF_MS", 500)),
            },
            poll_interval: Duration::from_secs(env_u64("LPR_POLL_INTERVAL_SECS", 10)),
            cycle_timeout: Duration::from_secs(env_u64("LPR_CYCLE_TIMEOUT_SECS", 30)),
            output_dir: env_path("LPR_OUTPUT_DIR").unwrap_or_else(|| PathBuf::from("data")),
            event_url,
            event,
            pipeline_config_path: env_path("LPR_PIPELINE_CONFIG"),
            metrics_textfile: env_path("LPR_METRICS_TEXTFILE"),
            label_font: env_path("LPR_LABEL_FONT"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_duration_ms(self.camera.fetch_timeout.as_millis() as u64, "LPR_FETCH_TIMEOUT_MS")?;
        validate_range(self.camera.max_retries, 0, 10, "LPR_FETCH_RETRIES")?;
        validate_duration_ms(self.poll_interval.as_millis() as u64, "LPR_POLL_INTERVAL_SECS")?;
        validate_duration_ms(self.cycle_timeout.as_millis() as u64, "LPR_CYCLE_TIMEOUT_SECS")?;
        validate_path_components(&self.output_dir, None, "LPR_OUTPUT_DIR")?;
        self.camera.capture_url()?;
        Ok(())
    }

    /// Load pipeline and model settings from `LPR_PIPELINE_CONFIG`, or defaults
    pub fn load_settings(&self) -> Result<PipelineSettings> {
        match &self.pipeline_config_path {
            Some(path) => PipelineSettings::from_file(path),
            None => Ok(PipelineSettings::default()),
        }
    }
}

/// Which plate locator strategy a pipeline uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    /// Edge/contour based, no learned model
    Traditional,
    /// External single-class plate detector
    #[default]
    Model,
}

/// Recognition settings, fixed for the lifetime of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Vehicle classes that restrict the plate search
    #[serde(default = "default_vehicle_classes")]
    pub vehicle_classes: Vec<VehicleClass>,

    /// Minimum vehicle detection confidence
    #[serde(default = "default_vehicle_confidence_threshold")]
    pub vehicle_confidence_threshold: f32,

    /// Minimum OCR confidence for a plate to be reported
    #[serde(default = "default_plate_confidence_threshold")]
    pub plate_confidence_threshold: f32,

    /// Minimum confidence for the learned plate locator
    #[serde(default = "default_plate_detection_threshold")]
    pub plate_detection_threshold: f32,

    #[serde(default)]
    pub locator_strategy: LocatorStrategy,

    #[serde(default = "default_min_plate_aspect_ratio")]
    pub min_plate_aspect_ratio: f32,

    #[serde(default = "default_max_plate_aspect_ratio")]
    pub max_plate_aspect_ratio: f32,

    /// Minimum plate bounding-box area in px²
    #[serde(default = "default_min_plate_area")]
    pub min_plate_area: u32,

    /// Search the whole frame when no vehicle passes the threshold
    #[serde(default)]
    pub full_frame_fallback: bool,

    /// Report each plate text once per frame
    #[serde(default = "default_deduplicate")]
    pub deduplicate: bool,

    /// Plate text rules
    #[serde(default)]
    pub validation: ValidationRules,
}

fn default_vehicle_classes() -> Vec<VehicleClass> {
    vec![VehicleClass::Car, VehicleClass::Bus, VehicleClass::Truck]
}

fn default_vehicle_confidence_threshold() -> f32 {
    0.5
}

fn default_plate_confidence_threshold() -> f32 {
    0.5
}

fn default_plate_detection_threshold() -> f32 {
    0.3
}

fn default_min_plate_aspect_ratio() -> f32 {
    2.0
}

fn default_max_plate_aspect_ratio() -> f32 {
    6.0
}

fn default_min_plate_area() -> u32 {
    400
}

fn default_deduplicate() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vehicle_classes: default_vehicle_classes(),
            vehicle_confidence_threshold: default_vehicle_confidence_threshold(),
            plate_confidence_threshold: default_plate_confidence_threshold(),
            plate_detection_threshold: default_plate_detection_threshold(),
            locator_strategy: LocatorStrategy::default(),
            min_plate_aspect_ratio: default_min_plate_aspect_ratio(),
            max_plate_aspect_ratio: default_max_plate_aspect_ratio(),
            min_plate_area: default_min_plate_area(),
            full_frame_fallback: false,
            deduplicate: default_deduplicate(),
            validation: ValidationRules::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vehicle_classes.is_empty() {
            anyhow::bail!("vehicle_classes cannot be empty");
        }
        validate_unit_interval(self.vehicle_confidence_threshold, "vehicle_confidence_threshold")?;
        validate_unit_interval(self.plate_confidence_threshold, "plate_confidence_threshold")?;
        validate_unit_interval(self.plate_detection_threshold, "plate_detection_threshold")?;

        if !(self.min_plate_aspect_ratio.is_finite() && self.min_plate_aspect_ratio > 0.0) {
            anyhow::bail!(
                "min_plate_aspect_ratio must be positive, got {}",
                self.min_plate_aspect_ratio
            );
        }
        if !(self.max_plate_aspect_ratio.is_finite()
            && self.max_plate_aspect_ratio >= self.min_plate_aspect_ratio)
        {
            anyhow::bail!(
                "max_plate_aspect_ratio ({}) must be >= min_plate_aspect_ratio ({})",
                self.max_plate_aspect_ratio,
                self.min_plate_aspect_ratio
            );
        }
        if self.min_plate_area == 0 {
            anyhow::bail!("min_plate_area must be greater than 0");
        }

        self.validation.validate().context("Invalid validation rules")
    }
}

/// Model locations and runtime options for the ONNX capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Vehicle detector (COCO-style YOLOv8)
    #[serde(default = "YoloConfig::vehicle_default")]
    pub vehicle: YoloConfig,

    /// Single-class plate detector, used by the model locator
    #[serde(default = "YoloConfig::plate_default")]
    pub plate: YoloConfig,

    #[serde(default)]
    pub ocr: OcrModelConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            vehicle: YoloConfig::vehicle_default(),
            plate: YoloConfig::plate_default(),
            ocr: OcrModelConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

/// Contents of the `LPR_PIPELINE_CONFIG` file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub models: ModelsConfig,
}

impl PipelineSettings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config {}", path.display()))?;
        let settings: PipelineSettings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse pipeline config {}", path.display()))?;
        settings.pipeline.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.vehicle_classes.len(), 3);
        assert_eq!(config.plate_confidence_threshold, 0.5);
        assert_eq!(config.plate_detection_threshold, 0.3);
        assert_eq!(config.locator_strategy, LocatorStrategy::Model);
        assert_eq!(config.min_plate_aspect_ratio, 2.0);
        assert_eq!(config.max_plate_aspect_ratio, 6.0);
        assert_eq!(config.min_plate_area, 400);
        assert!(!config.full_frame_fallback);
        assert!(config.deduplicate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = serde_json::json!({
            "pipeline": {
                "locator_strategy": "traditional",
                "vehicle_classes": ["car", "motorcycle"],
                "validation": { "patterns": ["LLLDDD"] }
            }
        });
        let settings: PipelineSettings = serde_json::from_value(json).unwrap();

        assert_eq!(settings.pipeline.locator_strategy, LocatorStrategy::Traditional);
        assert_eq!(
            settings.pipeline.vehicle_classes,
            vec![VehicleClass::Car, VehicleClass::Motorcycle]
        );
        assert_eq!(settings.pipeline.validation.patterns, vec!["LLLDDD".to_string()]);
        assert_eq!(settings.pipeline.validation.min_length, 5);
        assert_eq!(settings.pipeline.vehicle_confidence_threshold, 0.5);
        assert_eq!(settings.models.ocr.input_width, 200);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig {
            plate_confidence_threshold: 1.5,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        config.plate_confidence_threshold = 0.5;
        config.max_plate_aspect_ratio = 1.0;
        assert!(config.validate().is_err());

        config.max_plate_aspect_ratio = 6.0;
        config.vehicle_classes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            r#"{"pipeline": {"min_plate_area": 900}, "models": {"execution": {"provider": "CUDA"}}}"#,
        )
        .unwrap();

        let settings = PipelineSettings::from_file(&path).unwrap();
        assert_eq!(settings.pipeline.min_plate_area, 900);
        assert_eq!(settings.models.execution.provider, "CUDA");

        std::fs::write(&path, r#"{"pipeline": {"min_plate_area": 0}}"#).unwrap();
        assert!(PipelineSettings::from_file(&path).is_err());
    }

    #[test]
    fn test_capture_url() {
        let camera = CameraConfig::new(Url::parse("http://192.168.5.32:81").unwrap());
        assert_eq!(
            camera.capture_url().unwrap().as_str(),
            "http://192.168.5.32:81/capture"
        );

        let mut behind_proxy = CameraConfig::new(Url::parse("http://127.0.0.1:81/cam1").unwrap());
        assert_eq!(
            behind_proxy.capture_url().unwrap().as_str(),
            "http://127.0.0.1:81/cam1/capture"
        );
        behind_proxy.base_url = Url::parse("http://127.0.0.1:81/cam1/").unwrap();
        behind_proxy.capture_path = "still".to_string();
        assert_eq!(
            behind_proxy.capture_url().unwrap().as_str(),
            "http://127.0.0.1:81/cam1/still"
        );
    }

    #[test]
    fn test_endpoint_url_rejects_opaque_base() {
        let opaque = Url::parse("mailto:garage@example.com").unwrap();
        assert!(endpoint_url(&opaque, "/capture").is_err());
    }

    #[test]
    fn test_service_config_validation() {
        let config = ServiceConfig {
            camera: CameraConfig::new(Url::parse("http://camera.local").unwrap()),
            poll_interval: Duration::from_secs(10),
            cycle_timeout: Duration::from_secs(30),
            output_dir: PathBuf::from("data"),
            event_url: None,
            event: CarEvent::Enter,
            pipeline_config_path: None,
            metrics_textfile: None,
            label_font: None,
        };
        assert!(config.validate().is_ok());

        let bad = ServiceConfig {
            poll_interval: Duration::ZERO,
            ..config.clone()
        };
        assert!(bad.validate().is_err());

        let escaping = ServiceConfig {
            output_dir: PathBuf::from("../elsewhere"),
            ..config
        };
        assert!(escaping.validate().is_err());
    }
}
