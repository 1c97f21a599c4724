use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::adapters::firebase::FirebaseConfig;
use crate::domain::{
    camera::{CameraAddress, CaptureMode, FrameSize, ReconnectPolicy},
    errors::{DomainError, DomainResult},
    model::{AlertPolicy, InferenceConfig, ModelId, YoloParams},
};

/// Application configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    /// Prefix for the WebSocket routes, always starting with `/`.
    pub api_prefix: String,
    pub static_dir: PathBuf,
    pub camera: CameraAddress,
    pub capture: CaptureMode,
    /// Longest a single camera read may block before it counts as a failure.
    pub camera_read_timeout: Duration,
    pub jpeg_quality: u8,
    pub inference: InferenceConfig,
    pub alerts: AlertPolicy,
    pub reconnect: ReconnectPolicy,
    pub notify_send_timeout: Duration,
    pub stream_send_timeout: Duration,
    /// `None` disables the notification bridge and the detection sink.
    pub firebase: Option<FirebaseConfig>,
    pub notifications_path: String,
    pub detections_path: String,
}

impl AppConfig {
    pub fn from_env() -> DomainResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DomainResult<Self> {
        let text = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let list = |key: &str, default: &str| -> Vec<String> {
            text(key, default)
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };

        let model_path = text("MODEL_PATH", "models/fall_detection.onnx");
        let model_name = PathBuf::from(&model_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".into());

        let mut api_prefix = text("API_PREFIX", "/api/v1");
        if !api_prefix.starts_with('/') {
            api_prefix.insert(0, '/');
        }

        let config = Self {
            app_name: text("APP_NAME", "Fall Detection API"),
            host: text("HOST", "0.0.0.0"),
            port: parsed(&lookup, "PORT", 8000),
            api_prefix,
            static_dir: PathBuf::from(text("STATIC_DIR", "static")),
            camera: CameraAddress(text("CAMERA_URL", "/dev/video0")),
            capture: CaptureMode {
                fourcc: text("CAMERA_FOURCC", "MJPG"),
                size: FrameSize {
                    width: parsed(&lookup, "CAMERA_WIDTH", 640),
                    height: parsed(&lookup, "CAMERA_HEIGHT", 480),
                },
                fps: parsed(&lookup, "CAMERA_FPS", 30),
            },
            camera_read_timeout: Duration::from_millis(parsed(&lookup, "CAMERA_READ_TIMEOUT_MS", 5000)),
            jpeg_quality: parsed(&lookup, "JPEG_QUALITY", 80),
            inference: InferenceConfig {
                model: ModelId {
                    name: model_name,
                    onnx_path: model_path,
                },
                params: YoloParams {
                    input_size: parsed(&lookup, "MODEL_INPUT_SIZE", 640),
                    conf_threshold: parsed(&lookup, "MODEL_CONF_THRESHOLD", 0.25),
                    max_detections: parsed(&lookup, "MODEL_MAX_DETECTIONS", 100),
                },
                class_labels: list("CLASS_LABELS", "fall,person"),
            },
            alerts: AlertPolicy {
                classes: list("ALERT_CLASSES", "fall"),
                confidence_threshold: parsed(&lookup, "ALERT_CONFIDENCE_THRESHOLD", 0.9),
                cooldown: Duration::from_secs(parsed(&lookup, "ALERT_COOLDOWN_SECS", 50)),
            },
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(parsed(&lookup, "RECONNECT_INITIAL_DELAY_MS", 1000)),
                max_attempts: parsed(&lookup, "RECONNECT_MAX_ATTEMPTS", 5),
            },
            notify_send_timeout: Duration::from_millis(parsed(&lookup, "NOTIFY_SEND_TIMEOUT_MS", 2000)),
            stream_send_timeout: Duration::from_millis(parsed(&lookup, "STREAM_SEND_TIMEOUT_MS", 5000)),
            firebase: lookup("FIREBASE_DATABASE_URL")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|database_url| FirebaseConfig {
                    database_url,
                    auth_token: lookup("FIREBASE_AUTH_TOKEN").filter(|t| !t.trim().is_empty()),
                }),
            notifications_path: text("NOTIFICATIONS_PATH", "notifications"),
            detections_path: text("DETECTIONS_PATH", "detections"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> DomainResult<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(DomainError::InvalidInput(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        unit("ALERT_CONFIDENCE_THRESHOLD", self.alerts.confidence_threshold)?;
        unit("MODEL_CONF_THRESHOLD", self.inference.params.conf_threshold)?;
        if self.alerts.cooldown.is_zero() {
            return Err(DomainError::InvalidInput("ALERT_COOLDOWN_SECS must be positive".into()));
        }
        if self.reconnect.initial_delay.is_zero() || self.reconnect.max_attempts == 0 {
            return Err(DomainError::InvalidInput(
                "reconnect delay and attempt budget must be positive".into(),
            ));
        }
        for (name, value) in [
            ("NOTIFY_SEND_TIMEOUT_MS", self.notify_send_timeout),
            ("STREAM_SEND_TIMEOUT_MS", self.stream_send_timeout),
            ("CAMERA_READ_TIMEOUT_MS", self.camera_read_timeout),
        ] {
            if value.is_zero() {
                return Err(DomainError::InvalidInput(format!("{name} must be positive")));
            }
        }
        if self.inference.params.input_size == 0 {
            return Err(DomainError::InvalidInput("MODEL_INPUT_SIZE must be positive".into()));
        }
        if self.inference.class_labels.is_empty() {
            return Err(DomainError::InvalidInput("CLASS_LABELS is empty".into()));
        }
        Ok(())
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, default = %default, "invalid setting; using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> DomainResult<AppConfig> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_documented_table() {
        let cfg = config(&[]).expect("defaults are valid");
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8000");
        assert_eq!(cfg.api_prefix, "/api/v1");
        assert_eq!(cfg.camera.as_str(), "/dev/video0");
        assert_eq!(cfg.alerts.cooldown, Duration::from_secs(50));
        assert_eq!(cfg.alerts.confidence_threshold, 0.9);
        assert_eq!(cfg.alerts.classes, vec!["fall"]);
        assert_eq!(cfg.inference.class_labels, vec!["fall", "person"]);
        assert_eq!(cfg.inference.model.name, "fall_detection");
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.camera_read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.stream_send_timeout, Duration::from_secs(5));
        assert!(cfg.firebase.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("PORT", "9000"),
            ("API_PREFIX", "api"),
            ("CAMERA_URL", "http://192.168.1.20:8080/video"),
            ("ALERT_COOLDOWN_SECS", "30"),
            ("FIREBASE_DATABASE_URL", "https://demo.firebaseio.com"),
        ])
        .expect("valid");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.api_prefix, "/api");
        assert!(cfg.camera.is_http());
        assert_eq!(cfg.alerts.cooldown, Duration::from_secs(30));
        let firebase = cfg.firebase.expect("firebase enabled");
        assert_eq!(firebase.database_url, "https://demo.firebaseio.com");
        assert!(firebase.auth_token.is_none());
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let cfg = config(&[("PORT", "eighty"), ("CAMERA_FPS", "-3")]).expect("valid");
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.capture.fps, 30);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(matches!(
            config(&[("ALERT_CONFIDENCE_THRESHOLD", "1.5")]),
            Err(DomainError::InvalidInput(_))
        ));
        assert!(matches!(config(&[("ALERT_COOLDOWN_SECS", "0")]), Err(DomainError::InvalidInput(_))));
        assert!(matches!(config(&[("RECONNECT_MAX_ATTEMPTS", "0")]), Err(DomainError::InvalidInput(_))));
        assert!(matches!(config(&[("CAMERA_READ_TIMEOUT_MS", "0")]), Err(DomainError::InvalidInput(_))));
    }
}
