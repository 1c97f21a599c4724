use std::sync::Arc;

use crate::application::ports::{CaptureBackend, CaptureDevice};
use crate::domain::{camera::CameraAddress, errors::DomainResult};

/// Picks the capture backend from the address scheme: `http(s)://` goes to
/// the MJPEG reader, anything else is treated as a V4L2 device path.
pub struct CaptureRouter {
    device: Arc<dyn CaptureBackend>,
    http: Arc<dyn CaptureBackend>,
}

impl CaptureRouter {
    pub fn new(device: Arc<dyn CaptureBackend>, http: Arc<dyn CaptureBackend>) -> Self {
        Self { device, http }
    }
}

impl CaptureBackend for CaptureRouter {
    fn open(&self, address: &CameraAddress) -> DomainResult<Box<dyn CaptureDevice>> {
        if address.is_http() {
            self.http.open(address)
        } else {
            self.device.open(address)
        }
    }
}
