use anyhow::{Context, Result};
use clap::Parser;
use common::plates::CarEvent;
use lpr_service::{
    capability::{
        ocr::OnnxTextRecognizer, yolo::YoloDetector, ObjectDetector, TextRecognizer,
    },
    config::LocatorStrategy,
    sink::{EventSink, HttpEventSink, LogEventSink},
    source::expand_image_paths,
    CameraPoller, ImageSource, ImageTarget, PlatePipeline, PollerSettings, ResultAssembler,
    ServiceConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// License plate recognition for a garage camera
#[derive(Debug, Parser)]
#[command(name = "lpr-service", version)]
struct Args {
    /// Process these images (or directories of images) once and exit
    #[arg(long, num_args = 1..)]
    image: Vec<PathBuf>,

    /// Run a single camera cycle and exit
    #[arg(long, conflicts_with = "image")]
    once: bool,

    /// Event reported with each plate, overrides LPR_EVENT
    #[arg(long)]
    event: Option<CarEvent>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = telemetry::init_with_service("lpr-service");

    info!(version = env!("CARGO_PKG_VERSION"), "Starting LPR service...");

    let mut config = ServiceConfig::from_env()?;
    if let Some(event) = args.event {
        config.event = event;
    }
    info!(
        camera = %config.camera.base_url,
        output_dir = %config.output_dir.display(),
        event = %config.event,
        "LPR service configuration"
    );

    let pipeline = Arc::new(build_pipeline(&config)?);
    let source = ImageSource::new(config.camera.clone())?;
    let sink: Arc<dyn EventSink> = match &config.event_url {
        Some(url) => {
            info!(url = %url, "Publishing plate events to collaborator");
            Arc::new(HttpEventSink::new(url, config.camera.fetch_timeout)?)
        }
        None => {
            info!("No LPR_EVENT_URL set, plate events are logged only");
            Arc::new(LogEventSink)
        }
    };

    let poller = Arc::new(CameraPoller::new(
        source,
        pipeline,
        sink,
        PollerSettings {
            poll_interval: config.poll_interval,
            cycle_timeout: config.cycle_timeout,
            output_dir: config.output_dir.clone(),
            event: config.event,
            metrics_textfile: config.metrics_textfile.clone(),
        },
    ));

    if !args.image.is_empty() {
        return process_files(&poller, &args.image).await;
    }

    if args.once {
        let report = poller.process_once(&ImageTarget::Camera).await?;
        info!(
            plates = report.records.len(),
            image = %report.image_path.display(),
            "Camera cycle complete"
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(poller.clone().run(shutdown.clone()));

    shutdown_signal().await;
    info!("Shutting down gracefully...");
    shutdown.cancel();
    handle.await.context("Camera poller task failed")?;

    Ok(())
}

/// Load the ONNX capabilities named in the pipeline settings
fn build_pipeline(config: &ServiceConfig) -> Result<PlatePipeline> {
    let settings = config.load_settings()?;
    let execution = settings.models.execution.clone().with_env_overrides();

    let vehicle_detector: Arc<dyn ObjectDetector> = Arc::new(
        YoloDetector::load("yolov8_vehicle", settings.models.vehicle.clone(), &execution)
            .context("Failed to load vehicle detector")?,
    );

    let plate_detector: Option<Arc<dyn ObjectDetector>> =
        match settings.pipeline.locator_strategy {
            LocatorStrategy::Model => Some(Arc::new(
                YoloDetector::load("yolov8_plate", settings.models.plate.clone(), &execution)
                    .context("Failed to load plate detector")?,
            )),
            LocatorStrategy::Traditional => None,
        };

    let recognizer: Arc<dyn TextRecognizer> = Arc::new(
        OnnxTextRecognizer::load(settings.models.ocr.clone(), &execution)
            .context("Failed to load OCR model")?,
    );

    let assembler = match &config.label_font {
        Some(path) => ResultAssembler::load_font(path)?,
        None => ResultAssembler::default(),
    };

    Ok(PlatePipeline::new(
        Arc::new(settings.pipeline),
        vehicle_detector,
        plate_detector,
        recognizer,
    )?
    .with_assembler(assembler))
}

async fn process_files(poller: &CameraPoller, paths: &[PathBuf]) -> Result<()> {
    let targets = expand_image_paths(paths)?;
    if targets.is_empty() {
        warn!("No input images found");
        return Ok(());
    }

    let mut failed = 0usize;
    for target in &targets {
        match poller.process_once(target).await {
            Ok(report) => {
                let plates: Vec<&str> = report.records.iter().map(|r| r.plate.as_str()).collect();
                info!(
                    image_target = %target,
                    plates = ?plates,
                    output = %report.image_path.display(),
                    "Image processed"
                );
            }
            Err(e) => {
                failed += 1;
                let reason = format!("{:#}", e);
                error!(image_target = %target, error = %reason, "Image processing failed");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} images failed", failed, targets.len());
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
