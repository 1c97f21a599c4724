use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::application::cooldown::{CooldownDecision, CooldownGate};
use crate::application::ports::EventSink;
use crate::domain::{
    detection::{Detection, DetectionEvent},
    model::AlertPolicy,
};

/// Turns confident detections of watched classes into persisted events,
/// at most one per class per cooldown window.
pub struct AlertService {
    gate: CooldownGate,
    policy: AlertPolicy,
    sink: Option<Arc<dyn EventSink>>,
}

impl AlertService {
    pub fn new(policy: AlertPolicy, sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            gate: CooldownGate::new(),
            policy,
            sink,
        }
    }

    /// Returns the events that passed the gate, stamped with the frame's capture time.
    /// Persisting runs in the background so a slow sink never holds up the frame path.
    pub fn observe(&self, detections: &[Detection], captured_at: DateTime<Utc>) -> Vec<DetectionEvent> {
        let now = Instant::now();
        let mut accepted = Vec::new();
        for det in detections {
            // "FALL" and "fall" share one cooldown window and one event label.
            let Some(class) = self.policy.alert_class(&det.label) else {
                continue;
            };
            match self.gate.admit(
                class,
                det.score,
                self.policy.confidence_threshold,
                self.policy.cooldown,
                now,
            ) {
                CooldownDecision::Accepted => {
                    let mut event = DetectionEvent::from_detection(det, captured_at);
                    event.class_label = class.to_string();
                    info!(class = %event.class_label, confidence = event.confidence, "alert raised");
                    self.dispatch(event.clone());
                    accepted.push(event);
                }
                CooldownDecision::CoolingDown { remaining } => {
                    debug!(class, remaining_secs = remaining.as_secs(), "alert suppressed by cooldown");
                }
                CooldownDecision::BelowThreshold => {}
            }
        }
        accepted
    }

    fn dispatch(&self, event: DetectionEvent) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        tokio::spawn(async move {
            match sink.persist(&event).await {
                Ok(true) => debug!(class = %event.class_label, "detection event persisted"),
                Ok(false) => debug!(class = %event.class_label, "detection event suppressed by sink"),
                Err(e) => warn!(class = %event.class_label, error = %e, "failed to persist detection event"),
            }
        });
    }
}
