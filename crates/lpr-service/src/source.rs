use crate::config::CameraConfig;
use crate::error::PipelineError;
use crate::frame::Frame;
use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use telemetry::metrics::{LPR_CAMERA_FETCHES, LPR_STAGE_DURATION};
use tracing::{debug, info, warn};

/// What to acquire a frame from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTarget {
    File(PathBuf),
    Camera,
}

impl FromStr for ImageTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("camera") {
            Ok(ImageTarget::Camera)
        } else {
            Ok(ImageTarget::File(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageTarget::File(path) => write!(f, "{}", path.display()),
            ImageTarget::Camera => write!(f, "camera"),
        }
    }
}

/// Acquires raw frames from disk or from the configured camera.
///
/// The camera configuration is fixed at construction; nothing here is process-wide.
#[derive(Clone)]
pub struct ImageSource {
    camera: CameraConfig,
    client: reqwest::Client,
}

impl ImageSource {
    pub fn new(camera: CameraConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(camera.fetch_timeout)
            .build()
            .context("Failed to build camera HTTP client")?;
        Ok(Self { camera, client })
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub async fn acquire(&self, target: &ImageTarget) -> Result<Frame, PipelineError> {
        let started = Instant::now();
        let result = match target {
            ImageTarget::File(path) => self.read_file(path).await,
            ImageTarget::Camera => self.fetch_camera().await,
        };
        LPR_STAGE_DURATION
            .with_label_values(&["acquire"])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn read_file(&self, path: &Path) -> Result<Frame, PipelineError> {
        let source_id = path.display().to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::source_unavailable(&source_id, 1, e.to_string()))?;
        debug!(path = %source_id, bytes = bytes.len(), "Read image file");
        Frame::decode(&bytes, Some(source_id))
    }

    /// GET the capture endpoint, retrying transport errors, timeouts and non-2xx statuses
    async fn fetch_camera(&self) -> Result<Frame, PipelineError> {
        let url = self.camera.capture_url().map_err(|e| {
            PipelineError::source_unavailable(self.camera.base_url.as_str(), 0, format!("{:#}", e))
        })?;
        let attempts = 1 + self.camera.max_retries;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.fetch_bytes(&url).await {
                Ok(bytes) => {
                    LPR_CAMERA_FETCHES.with_label_values(&["ok"]).inc();
                    info!(url = %url, attempt, bytes = bytes.len(), "Captured frame from camera");
                    // Bytes arrived; a bad image is not worth another request
                    return Frame::decode(&bytes, Some(url.to_string()));
                }
                Err(reason) => {
                    warn!(url = %url, attempt, max_attempts = attempts, error = %reason, "Camera fetch failed");
                    last_error = reason;
                    if attempt < attempts {
                        LPR_CAMERA_FETCHES.with_label_values(&["retry"]).inc();
                        tokio::time::sleep(self.camera.retry_backoff).await;
                    }
                }
            }
        }

        LPR_CAMERA_FETCHES.with_label_values(&["failed"]).inc();
        Err(PipelineError::source_unavailable(url.as_str(), attempts, last_error))
    }

    async fn fetch_bytes(&self, url: &reqwest::Url) -> Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| describe_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("camera returned HTTP {}", status));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| describe_request_error(&e))?;
        Ok(body.to_vec())
    }
}

/// Expand command-line image arguments: directories contribute their JPEG/PNG files
/// (sorted, skipping earlier `result_*` outputs), anything else is taken as a file.
pub fn expand_image_paths(paths: &[PathBuf]) -> Result<Vec<ImageTarget>> {
    let mut targets = Vec::new();
    for path in paths {
        if !path.is_dir() {
            targets.push(ImageTarget::File(path.clone()));
            continue;
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("Failed to list {}", path.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_input_image(p))
            .collect();
        files.sort();
        debug!(dir = %path.display(), count = files.len(), "Expanded image directory");
        targets.extend(files.into_iter().map(ImageTarget::File));
    }
    Ok(targets)
}

fn is_input_image(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with("result_") {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

fn describe_request_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {}", err)
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}
