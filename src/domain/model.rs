use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelId {
    pub name: String,       // logical name, e.g. "fall_detection"
    pub onnx_path: String,  // filesystem path
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoloParams {
    pub input_size: u32,        // 640 typical
    pub conf_threshold: f32,    // 0..1
    pub max_detections: usize,  // e.g. 100
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            conf_threshold: 0.25,
            max_detections: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub model: ModelId,
    pub params: YoloParams,
    /// Index = class id reported by the model.
    pub class_labels: Vec<String>,
}

impl InferenceConfig {
    pub fn label_for(&self, class_id: usize) -> String {
        self.class_labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{class_id}"))
    }
}

/// Which detections may raise a notification, and how often.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPolicy {
    pub classes: Vec<String>,
    pub confidence_threshold: f32,
    pub cooldown: std::time::Duration,
}

impl AlertPolicy {
    /// The configured class a detected label falls under, matched without regard to case.
    pub fn alert_class(&self, label: &str) -> Option<&str> {
        self.classes
            .iter()
            .find(|c| c.eq_ignore_ascii_case(label))
            .map(String::as_str)
    }
}
