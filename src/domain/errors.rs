use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    /// The camera could not be opened, or opened but produced no readable frame.
    #[error("camera unavailable: {0}")]
    Acquisition(String),
    /// A single read from an open camera failed. Drives reconnection, never surfaced per read.
    #[error("frame read failed: {0}")]
    ReadFailure(String),
    /// Every reconnect attempt failed. The camera stays failed until the process restarts.
    #[error("camera reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("detector failed: {0}")]
    Detector(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("transmit failed: {0}")]
    Transmit(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl DomainError {
    /// True for failures that mean "there is no camera to stream from".
    pub fn is_camera_unavailable(&self) -> bool {
        matches!(
            self,
            DomainError::Acquisition(_) | DomainError::ReconnectExhausted { .. }
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
