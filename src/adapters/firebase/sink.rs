use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::adapters::firebase::FirebaseConfig;
use crate::application::ports::EventSink;
use crate::domain::{
    detection::DetectionEvent,
    errors::{DomainError, DomainResult},
};

/// Record stored under the detections path.
#[derive(Debug, Serialize)]
struct DetectionRecord<'a> {
    class: &'a str,
    confidence: f32,
    bbox: [f32; 4],
    timestamp: String,
}

impl<'a> From<&'a DetectionEvent> for DetectionRecord<'a> {
    fn from(event: &'a DetectionEvent) -> Self {
        Self {
            class: &event.class_label,
            confidence: event.confidence,
            bbox: event.bbox,
            timestamp: event.timestamp.to_rfc3339(),
        }
    }
}

/// Appends detection events with push semantics (`POST` generates the key).
pub struct FirebaseEventSink {
    client: reqwest::Client,
    url: String,
}

impl FirebaseEventSink {
    pub fn new(config: &FirebaseConfig, detections_path: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: config.url_for(detections_path),
        })
    }
}

#[async_trait]
impl EventSink for FirebaseEventSink {
    async fn persist(&self, event: &DetectionEvent) -> DomainResult<bool> {
        let response = self
            .client
            .post(&self.url)
            .json(&DetectionRecord::from(event))
            .send()
            .await
            .map_err(|e| DomainError::Transmit(format!("detection push failed: {e}")))?;
        if !response.status().is_success() {
            return Err(DomainError::Transmit(format!(
                "detection push rejected with {}",
                response.status()
            )));
        }
        Ok(true)
    }
}
