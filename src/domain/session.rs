use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Why the server ended a session. Each maps to a distinct close code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Normal,
    CameraUnavailable,
    InternalError,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::CameraUnavailable => 1001,
            CloseReason::InternalError => 1011,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            CloseReason::Normal => "normal close",
            CloseReason::CameraUnavailable => "camera unavailable",
            CloseReason::InternalError => "internal error",
        }
    }
}

/// How a session loop ended. Every variant leads to the same single release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// Peer closed, or the registry shut the session down.
    Closed,
    /// A send failed or the transport reported an error.
    TransportError(String),
    /// The camera went to `Failed` while the session was live.
    CameraFailed,
    /// The session task panicked.
    Fault(String),
}

impl SessionExit {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            SessionExit::Closed | SessionExit::TransportError(_) => CloseReason::Normal,
            SessionExit::CameraFailed => CloseReason::CameraUnavailable,
            SessionExit::Fault(_) => CloseReason::InternalError,
        }
    }
}
