use crate::config::endpoint_url;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::plates::PlateRecord;
use reqwest::Url;
use std::time::Duration;
use telemetry::metrics::LPR_EVENTS_PUBLISHED;
use tracing::{info, warn};

/// Path of the dashboard's car-event ingestion endpoint
pub const CAR_EVENT_PATH: &str = "/api/car_event";

/// Downstream consumer of plate records (dashboard, occupancy store, ...)
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, record: &PlateRecord) -> Result<()>;
}

/// Publish every record, logging and counting failures without propagating them
pub async fn publish_all(sink: &dyn EventSink, records: &[PlateRecord]) -> usize {
    let mut delivered = 0;
    for record in records {
        match sink.publish(record).await {
            Ok(()) => {
                LPR_EVENTS_PUBLISHED.with_label_values(&["ok"]).inc();
                delivered += 1;
            }
            Err(e) => {
                LPR_EVENTS_PUBLISHED.with_label_values(&["failed"]).inc();
                let error = format!("{:#}", e);
                warn!(
                    sink = sink.name(),
                    plate = %record.plate,
                    error = %error,
                    "Failed to publish plate record"
                );
            }
        }
    }
    delivered
}

/// POSTs records as JSON to the dashboard collaborator
pub struct HttpEventSink {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpEventSink {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self> {
        let endpoint =
            endpoint_url(base_url, CAR_EVENT_PATH).context("Invalid event collaborator URL")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build event HTTP client")?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn publish(&self, record: &PlateRecord) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(record)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned HTTP {}: {}", self.endpoint, status, body.trim());
        }
        info!(plate = %record.plate, event = %record.event, "Plate event published");
        Ok(())
    }
}

/// Logs records when no collaborator is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, record: &PlateRecord) -> Result<()> {
        info!(
            plate = %record.plate,
            event = %record.event,
            confidence = record.confidence,
            image_path = record.image_path.as_deref().unwrap_or("-"),
            timestamp = %record.timestamp,
            "Plate event"
        );
        Ok(())
    }
}
