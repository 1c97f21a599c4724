use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Camera source address: a device path (`/dev/video0`) or a stream URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CameraAddress(pub String);

impl CameraAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_http(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }
}

impl std::fmt::Display for CameraAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

/// Requested capture mode. Drivers may round to the closest supported mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureMode {
    pub fourcc: String,
    pub size: FrameSize,
    pub fps: u32,
}

impl Default for CaptureMode {
    fn default() -> Self {
        Self {
            fourcc: "MJPG".into(),
            size: FrameSize { width: 640, height: 480 },
            fps: 30,
        }
    }
}

/// Lifecycle of the single camera. `Failed` is terminal for the process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Stopped,
    Starting,
    Running,
    Reconnecting { attempt: u32 },
    Failed,
}

impl CameraState {
    pub fn is_failed(self) -> bool {
        matches!(self, CameraState::Failed)
    }
}

impl std::fmt::Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraState::Stopped => f.write_str("stopped"),
            CameraState::Starting => f.write_str("starting"),
            CameraState::Running => f.write_str("running"),
            CameraState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            CameraState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay after the failed reopen `attempt` (zero based): `initial * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_initial_delay() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..5).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(500),
            max_attempts: 64,
        };
        assert!(policy.delay_for(40) >= policy.delay_for(31));
    }

    #[test]
    fn state_serializes_as_snake_case() {
        let json = serde_json::to_value(CameraState::Reconnecting { attempt: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({ "reconnecting": { "attempt": 2 } }));
        assert_eq!(serde_json::to_value(CameraState::Running).unwrap(), "running");
    }
}
