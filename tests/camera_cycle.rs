//! Camera acquisition and full poll cycles against in-process mock services
//!
//! A mock camera stands in for the ESP32 `/capture` endpoint and a mock
//! dashboard receives the published plate records.

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::plates::{BoundingBox, CarEvent, Detection, DetectionLabel, VehicleClass};
use image::{ImageFormat, RgbImage};
use lpr_service::{
    capability::mock::{ScriptedDetector, ScriptedRecognizer},
    config::{CameraConfig, PipelineConfig},
    sink::HttpEventSink,
    CameraPoller, ImageSource, ImageTarget, PipelineError, PlatePipeline, PollerSettings,
};
use reqwest::Url;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::{net::TcpListener, task::JoinHandle};

// --- Test Infrastructure ---

#[derive(Clone, Copy)]
enum Behaviour {
    Healthy,
    Slow(Duration),
    Status(StatusCode),
    Garbage,
    /// Fail this many requests with 503, then serve images
    FailFirst(usize),
}

#[derive(Clone)]
struct MockCamera {
    behaviour: Behaviour,
    hits: Arc<AtomicUsize>,
    image: Arc<Vec<u8>>,
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

async fn capture(State(camera): State<MockCamera>) -> Response {
    let hit = camera.hits.fetch_add(1, Ordering::SeqCst);
    let image = || {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/png")],
            camera.image.as_ref().clone(),
        )
            .into_response()
    };
    match camera.behaviour {
        Behaviour::Healthy => image(),
        Behaviour::Slow(delay) => {
            tokio::time::sleep(delay).await;
            image()
        }
        Behaviour::Status(status) => (status, "camera busy").into_response(),
        Behaviour::Garbage => (StatusCode::OK, "<html>not an image</html>").into_response(),
        Behaviour::FailFirst(n) if hit < n => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Behaviour::FailFirst(_) => image(),
    }
}

async fn spawn_router(router: Router) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Ok((addr, handle))
}

async fn spawn_camera(behaviour: Behaviour) -> (CameraConfig, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = MockCamera {
        behaviour,
        hits: hits.clone(),
        image: Arc::new(png_bytes(320, 240)),
    };
    let router = Router::new().route("/capture", get(capture)).with_state(state);
    let (addr, _handle) = spawn_router(router).await.unwrap();

    let mut camera = CameraConfig::new(Url::parse(&format!("http://{}", addr)).unwrap());
    camera.fetch_timeout = Duration::from_millis(300);
    camera.max_retries = 2;
    camera.retry_backoff = Duration::from_millis(20);
    (camera, hits)
}

type Received = Arc<Mutex<Vec<serde_json::Value>>>;

async fn spawn_dashboard() -> (Url, Received) {
    let received: Received = Arc::default();
    let router = Router::new()
        .route(
            "/api/car_event",
            post(
                |State(store): State<Received>, Json(body): Json<serde_json::Value>| async move {
                    store.lock().unwrap().push(body);
                    Json(serde_json::json!({"success": true}))
                },
            ),
        )
        .with_state(received.clone());
    let (addr, _handle) = spawn_router(router).await.unwrap();
    (Url::parse(&format!("http://{}", addr)).unwrap(), received)
}

fn scripted_pipeline(vehicles: Arc<ScriptedDetector>) -> PlatePipeline {
    PlatePipeline::new(
        Arc::new(PipelineConfig::default()),
        vehicles,
        Some(Arc::new(ScriptedDetector::new(
            "plates",
            vec![Detection::new(
                DetectionLabel::PlateRegion,
                0.7,
                BoundingBox::new(40, 60, 100, 25),
            )],
        ))),
        Arc::new(ScriptedRecognizer::constant("abc-123", 0.9)),
    )
    .unwrap()
}

fn car_detector() -> Arc<ScriptedDetector> {
    Arc::new(ScriptedDetector::new(
        "vehicles",
        vec![Detection::new(
            DetectionLabel::Vehicle(VehicleClass::Car),
            0.9,
            BoundingBox::new(20, 30, 200, 150),
        )],
    ))
}

// --- Acquisition ---

#[tokio::test]
async fn test_camera_capture_decodes_frame() {
    let (camera, hits) = spawn_camera(Behaviour::Healthy).await;
    let source = ImageSource::new(camera).unwrap();

    let frame = source.acquire(&ImageTarget::Camera).await.unwrap();
    assert_eq!((frame.width(), frame.height()), (320, 240));
    assert!(frame.source().unwrap().ends_with("/capture"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_camera_timeout_exhausts_retries() {
    let (camera, hits) = spawn_camera(Behaviour::Slow(Duration::from_secs(2))).await;
    let source = ImageSource::new(camera).unwrap();

    let err = source.acquire(&ImageTarget::Camera).await.unwrap_err();
    match err {
        PipelineError::SourceUnavailable { attempts, reason, .. } => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("timed out"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_camera_error_status_is_source_unavailable() {
    let (camera, hits) = spawn_camera(Behaviour::Status(StatusCode::INTERNAL_SERVER_ERROR)).await;
    let source = ImageSource::new(camera).unwrap();

    let err = source.acquire(&ImageTarget::Camera).await.unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable { attempts: 3, .. }));
    assert!(err.to_string().contains("500"));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_camera_recovers_within_retry_budget() {
    let (camera, hits) = spawn_camera(Behaviour::FailFirst(2)).await;
    let source = ImageSource::new(camera).unwrap();

    let frame = source.acquire(&ImageTarget::Camera).await.unwrap();
    assert_eq!(frame.width(), 320);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_undecodable_body_is_not_retried() {
    let (camera, hits) = spawn_camera(Behaviour::Garbage).await;
    let source = ImageSource::new(camera).unwrap();

    let err = source.acquire(&ImageTarget::Camera).await.unwrap_err();
    assert!(matches!(err, PipelineError::DecodeError { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

// --- Full cycles ---

#[tokio::test]
async fn test_camera_cycle_publishes_records() {
    let (camera, _hits) = spawn_camera(Behaviour::Healthy).await;
    let (dashboard, received) = spawn_dashboard().await;
    let output_dir = tempfile::tempdir().unwrap();

    let poller = CameraPoller::new(
        ImageSource::new(camera).unwrap(),
        Arc::new(scripted_pipeline(car_detector())),
        Arc::new(HttpEventSink::new(&dashboard, Duration::from_secs(2)).unwrap()),
        PollerSettings {
            poll_interval: Duration::from_secs(10),
            cycle_timeout: Duration::from_secs(5),
            output_dir: output_dir.path().to_path_buf(),
            event: CarEvent::Enter,
            metrics_textfile: None,
        },
    );

    let report = poller.process_once(&ImageTarget::Camera).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(report.image_path.exists());
    let name = report.image_path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("capture_") && name.ends_with(".jpg"), "{name}");

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let record = &received[0];
    assert_eq!(record["plate"], "ABC123");
    assert_eq!(record["event"], "enter");
    assert_eq!(record["box"], serde_json::json!([60, 90, 100, 25]));
    assert_eq!(record["vehicle_box"], serde_json::json!([20, 30, 200, 150]));
    assert_eq!(record["image_path"], report.image_path.display().to_string());
    assert!(chrono::DateTime::parse_from_rfc3339(record["timestamp"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_unavailable_camera_skips_pipeline() {
    let (camera, _hits) = spawn_camera(Behaviour::Status(StatusCode::BAD_GATEWAY)).await;
    let (dashboard, received) = spawn_dashboard().await;
    let output_dir = tempfile::tempdir().unwrap();
    let vehicles = car_detector();

    let poller = CameraPoller::new(
        ImageSource::new(camera).unwrap(),
        Arc::new(scripted_pipeline(vehicles.clone())),
        Arc::new(HttpEventSink::new(&dashboard, Duration::from_secs(2)).unwrap()),
        PollerSettings {
            poll_interval: Duration::from_secs(10),
            cycle_timeout: Duration::from_secs(5),
            output_dir: output_dir.path().join("out"),
            event: CarEvent::Exit,
            metrics_textfile: None,
        },
    );

    let err = poller.process_once(&ImageTarget::Camera).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::SourceUnavailable { .. })
    ));
    assert_eq!(vehicles.calls(), 0);
    assert!(received.lock().unwrap().is_empty());
    assert!(!output_dir.path().join("out").exists());
}
