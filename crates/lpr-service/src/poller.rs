//! Acquire-and-process cycles, one-shot or on a fixed interval.

use crate::assembler::annotated_file_name;
use crate::error::PipelineError;
use crate::pipeline::PlatePipeline;
use crate::sink::{publish_all, EventSink};
use crate::source::{ImageSource, ImageTarget};
use anyhow::{Context, Result};
use chrono::Local;
use common::plates::{CarEvent, PlateRecord};
use common::validation::validate_file_name;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings for the cycle runner, taken from `ServiceConfig`
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub cycle_timeout: Duration,
    pub output_dir: PathBuf,
    pub event: CarEvent,
    pub metrics_textfile: Option<PathBuf>,
}

/// What one cycle produced
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub target: ImageTarget,
    pub records: Vec<PlateRecord>,
    pub image_path: PathBuf,
    pub delivered: usize,
}

pub struct CameraPoller {
    source: ImageSource,
    pipeline: Arc<PlatePipeline>,
    sink: Arc<dyn EventSink>,
    settings: PollerSettings,
}

impl CameraPoller {
    pub fn new(
        source: ImageSource,
        pipeline: Arc<PlatePipeline>,
        sink: Arc<dyn EventSink>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            source,
            pipeline,
            sink,
            settings,
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    /// Poll the camera until `shutdown` is cancelled.
    ///
    /// Every tick starts an independent cycle bounded by `cycle_timeout`, so a
    /// stalled camera never holds up the next poll. In-flight cycles are awaited
    /// before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            camera = %self.source.camera().base_url,
            interval_secs = self.settings.poll_interval.as_secs_f64(),
            event = %self.settings.event,
            "Starting camera poller"
        );

        let mut interval = time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = JoinSet::new();
        let mut cycle_seq = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Camera poller cancelled");
                    break;
                }
                _ = interval.tick() => {
                    cycle_seq += 1;
                    let poller = self.clone();
                    cycles.spawn(async move { poller.bounded_cycle(cycle_seq).await });
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Poll cycle task panicked");
                    }
                }
            }
        }

        let in_flight = cycles.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight cycles");
        }
        while let Some(joined) = cycles.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Poll cycle task panicked");
            }
        }
        info!(total_cycles = cycle_seq, "Camera poller stopped");
    }

    async fn bounded_cycle(&self, cycle_seq: u64) {
        let cycle = self.process_once(&ImageTarget::Camera);
        match time::timeout(self.settings.cycle_timeout, cycle).await {
            Ok(Ok(report)) => {
                debug!(
                    cycle = cycle_seq,
                    plates = report.records.len(),
                    image = %report.image_path.display(),
                    "Poll cycle complete"
                );
            }
            Ok(Err(e)) => {
                let kind = e
                    .downcast_ref::<PipelineError>()
                    .map(PipelineError::kind)
                    .unwrap_or("internal");
                let error = format!("{:#}", e);
                error!(cycle = cycle_seq, kind, error = %error, "Poll cycle failed");
            }
            Err(_) => {
                warn!(
                    cycle = cycle_seq,
                    timeout_secs = self.settings.cycle_timeout.as_secs_f64(),
                    "Poll cycle timed out"
                );
            }
        }
    }

    /// One full cycle: acquire, recognize, save the annotated image, publish records
    pub async fn process_once(&self, target: &ImageTarget) -> Result<CycleReport> {
        let captured_at = Local::now();
        let frame = self.source.acquire(target).await?;

        let pipeline = self.pipeline.clone();
        let output = tokio::task::spawn_blocking(move || pipeline.run(&frame))
            .await
            .context("Pipeline task failed")??;

        let file_name = annotated_file_name(target, captured_at);
        validate_file_name(&file_name, "annotated image name")?;
        tokio::fs::create_dir_all(&self.settings.output_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create output directory {}",
                    self.settings.output_dir.display()
                )
            })?;
        let image_path = self.settings.output_dir.join(file_name);

        let annotated = output.annotated_image.clone();
        let save_path = image_path.clone();
        tokio::task::spawn_blocking(move || annotated.save(&save_path))
            .await
            .context("Image writer task failed")??;
        debug!(path = %image_path.display(), "Annotated image written");

        let records = output.records(self.settings.event, Some(&image_path), captured_at);
        if records.is_empty() {
            info!(image_target = %target, "No plate found");
        }
        let delivered = publish_all(self.sink.as_ref(), &records).await;

        self.write_metrics().await;

        Ok(CycleReport {
            target: target.clone(),
            records,
            image_path,
            delivered,
        })
    }

    async fn write_metrics(&self) {
        let Some(path) = self.settings.metrics_textfile.clone() else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || telemetry::write_textfile(&path)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = ?e, "Failed to write metrics textfile"),
            Err(e) => warn!(error = %e, "Metrics writer task failed"),
        }
    }
}
