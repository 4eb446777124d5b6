// Metric names and label sets are static, so construction cannot fail at runtime.
#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::io::Write;
use std::path::Path;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Pipeline Metrics ====
    pub static ref LPR_FRAMES_PROCESSED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_frames_processed_total",
                "Total number of frames run through the plate pipeline",
            ),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_PLATES_RECOGNIZED: IntCounter = {
        let metric = IntCounter::new(
            "lpr_plates_recognized_total",
            "Total number of validated plates emitted",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_CANDIDATES_REJECTED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_candidates_rejected_total",
                "Total number of plate candidates discarded",
            ),
            &["reason"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_STAGE_DURATION: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "lpr_stage_duration_seconds",
                "Time spent in each pipeline stage",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["stage"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_INFERENCE_DURATION: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "lpr_inference_duration_seconds",
                "Time spent on model inference (excluding pre/post processing)",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0]),
            &["capability", "provider"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Acquisition / Delivery Metrics ====
    pub static ref LPR_CAMERA_FETCHES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_camera_fetch_total",
                "Total number of camera capture requests",
            ),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_EVENTS_PUBLISHED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_events_published_total",
                "Total number of plate records handed to the event sink",
            ),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Encode the registry in the Prometheus text exposition format
pub fn gather_text() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}

/// Write the registry to a node-exporter textfile.
///
/// The file is written next to its destination and renamed into place so a
/// scraper never sees a partial file.
pub fn write_textfile(path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    let text = gather_text().context("failed to encode metrics")?;
    let tmp = path.with_extension("prom.tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all().ok();
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move metrics into {}", path.display()))?;
    Ok(())
}
