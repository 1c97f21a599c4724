use async_trait::async_trait;
use bytes::Bytes;
use image::RgbImage;

use crate::domain::{
    camera::{CameraAddress, CameraState},
    detection::{Detection, DetectionEvent},
    errors::DomainResult,
    notification::SourceEvent,
    session::CloseReason,
};
use crate::application::camera_lifecycle::CameraFeed;

/// What a single capture read produced.
pub enum CapturedImage {
    /// Already JPEG (MJPG cameras, MJPEG streams): published as-is.
    Jpeg(Vec<u8>),
    /// Raw pixels that still need encoding.
    Rgb(RgbImage),
}

/// An open camera handle. Dropping it releases the hardware.
pub trait CaptureDevice: Send {
    fn read(&mut self) -> DomainResult<CapturedImage>;
}

pub trait CaptureBackend: Send + Sync {
    fn open(&self, address: &CameraAddress) -> DomainResult<Box<dyn CaptureDevice>>;
}

pub trait FrameCodec: Send + Sync {
    fn decode(&self, jpeg: &[u8]) -> DomainResult<RgbImage>;
    fn encode(&self, image: &RgbImage) -> DomainResult<Vec<u8>>;
}

pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> DomainResult<Vec<Detection>>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// `Ok(true)` = stored, `Ok(false)` = suppressed by the sink.
    async fn persist(&self, event: &DetectionEvent) -> DomainResult<bool>;
}

/// Invoked by the event source from a thread the pipeline does not own.
pub type SourceCallback = Box<dyn Fn(SourceEvent) + Send + Sync + 'static>;

pub trait EventSourcePort: Send + Sync {
    fn subscribe(&self, path: &str, callback: SourceCallback) -> DomainResult<Box<dyn Subscription>>;
}

pub trait Subscription: Send {
    fn unsubscribe(&mut self);
}

/// Outbound half of a viewer or notification connection.
#[async_trait]
pub trait SessionSink: Send {
    async fn send_binary(&mut self, payload: Bytes) -> DomainResult<()>;
    async fn send_text(&mut self, payload: String) -> DomainResult<()>;
    async fn close(&mut self, reason: CloseReason);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message,
    Closed,
    Error(String),
}

/// Inbound half of a connection. `recv` must be cancel safe.
#[async_trait]
pub trait SessionStream: Send {
    async fn recv(&mut self) -> Inbound;
}

/// Counted access to the single camera.
#[async_trait]
pub trait CameraLease: Send + Sync {
    async fn acquire(&self) -> DomainResult<CameraFeed>;
    async fn release(&self);
    fn state(&self) -> CameraState;
}
