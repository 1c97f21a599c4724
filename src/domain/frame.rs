use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One encoded (JPEG) camera frame. Cloning shares the payload; nothing mutates it in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub jpeg: Bytes,
    pub captured_at: DateTime<Utc>,
    /// Monotonic per activation cycle, starting at 1.
    pub sequence: u64,
}

impl Frame {
    pub fn new(jpeg: impl Into<Bytes>, sequence: u64) -> Self {
        Self {
            jpeg: jpeg.into(),
            captured_at: Utc::now(),
            sequence,
        }
    }
}
