use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub class_id: usize,
    pub label: String,
}

impl Detection {
    pub fn bbox(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// A high-confidence detection that passed the cooldown gate, ready for the event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub class_label: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
    pub timestamp: DateTime<Utc>,
}

impl DetectionEvent {
    pub fn from_detection(det: &Detection, timestamp: DateTime<Utc>) -> Self {
        Self {
            class_label: det.label.clone(),
            confidence: det.score,
            bbox: det.bbox(),
            timestamp,
        }
    }
}

/// "2 person, 1 fall" style summary for logs.
pub fn summarize_detections(detections: &[Detection]) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for det in detections {
        match counts.iter_mut().find(|(label, _)| *label == det.label.as_str()) {
            Some((_, count)) => *count += 1,
            None => counts.push((det.label.as_str(), 1)),
        }
    }
    counts
        .iter()
        .map(|(label, count)| format!("{} {}", count, label))
        .collect::<Vec<_>>()
        .join(", ")
}
