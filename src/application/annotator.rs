use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::application::overlay::{self, ALERT_COLOR, DEFAULT_COLOR};
use crate::application::ports::{FrameCodec, ObjectDetector};
use crate::domain::{
    detection::{summarize_detections, Detection},
    errors::{DomainError, DomainResult},
    frame::Frame,
};

#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub jpeg: Bytes,
    pub detections: Vec<Detection>,
}

/// Decode, detect, draw, re-encode. Any failure forwards the frame as captured.
pub struct DetectionAnnotator {
    detector: Option<Arc<dyn ObjectDetector>>,
    codec: Arc<dyn FrameCodec>,
    alert_classes: Vec<String>,
}

impl DetectionAnnotator {
    pub fn new(detector: Arc<dyn ObjectDetector>, codec: Arc<dyn FrameCodec>, alert_classes: Vec<String>) -> Self {
        Self {
            detector: Some(detector),
            codec,
            alert_classes,
        }
    }

    /// Forwards every frame as-is. Used when no model could be loaded.
    pub fn passthrough(codec: Arc<dyn FrameCodec>) -> Self {
        Self {
            detector: None,
            codec,
            alert_classes: Vec::new(),
        }
    }

    /// Runs off the async runtime; inference is CPU/GPU bound.
    pub async fn process(self: &Arc<Self>, frame: Frame) -> AnnotatedFrame {
        if self.detector.is_none() {
            return Self::unannotated(frame);
        }
        let this = self.clone();
        let original = frame.clone();
        match tokio::task::spawn_blocking(move || this.annotate(&frame)).await {
            Ok(Ok((jpeg, detections))) => {
                if !detections.is_empty() {
                    debug!(sequence = original.sequence, found = %summarize_detections(&detections), "frame annotated");
                }
                AnnotatedFrame {
                    jpeg: Bytes::from(jpeg),
                    detections,
                }
            }
            Ok(Err(err)) => {
                warn!(sequence = original.sequence, error = %err, "annotation failed; forwarding raw frame");
                Self::unannotated(original)
            }
            Err(join) => {
                warn!(sequence = original.sequence, error = %join, "annotation task aborted; forwarding raw frame");
                Self::unannotated(original)
            }
        }
    }

    fn annotate(&self, frame: &Frame) -> DomainResult<(Vec<u8>, Vec<Detection>)> {
        let detector = self
            .detector
            .as_ref()
            .ok_or_else(|| DomainError::Detector("no detector loaded".into()))?;
        let mut image = self.codec.decode(&frame.jpeg)?;
        let detections = detector.detect(&image)?;
        overlay::draw_detections(&mut image, &detections, |label| {
            if self.alert_classes.iter().any(|c| c.eq_ignore_ascii_case(label)) {
                ALERT_COLOR
            } else {
                DEFAULT_COLOR
            }
        });
        let jpeg = self.codec.encode(&image)?;
        Ok((jpeg, detections))
    }

    fn unannotated(frame: Frame) -> AnnotatedFrame {
        AnnotatedFrame {
            jpeg: frame.jpeg,
            detections: Vec::new(),
        }
    }
}
