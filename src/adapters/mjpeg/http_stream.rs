use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use tracing::info;

use crate::application::ports::{CaptureBackend, CaptureDevice, CapturedImage};
use crate::domain::{
    camera::CameraAddress,
    errors::{DomainError, DomainResult},
};

const CHUNK_SIZE: usize = 64 * 1024;
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Opens `http(s)://` MJPEG streams such as phone camera apps.
///
/// A blocking client may not be built or dropped on a runtime thread, so each
/// `open` builds its own; it lives and dies with the device on the capture thread.
pub struct MjpegHttpBackend {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl MjpegHttpBackend {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

impl CaptureBackend for MjpegHttpBackend {
    fn open(&self, address: &CameraAddress) -> DomainResult<Box<dyn CaptureDevice>> {
        // The blocking client applies `timeout` to each body read, not to the
        // endless stream as a whole.
        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout)
            .build()
            .map_err(|e| DomainError::Acquisition(format!("http client: {e}")))?;
        let response = client
            .get(address.as_str())
            .send()
            .map_err(|e| DomainError::Acquisition(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(DomainError::Acquisition(format!("stream responded with {}", response.status())));
        }
        info!(url = %address, "mjpeg stream connected");
        Ok(Box::new(MjpegReader::new(response)))
    }
}

/// Splits a multipart MJPEG body into JPEGs by scanning for SOI/EOI markers.
pub struct MjpegReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> MjpegReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(CHUNK_SIZE * 2),
        }
    }

    pub fn next_jpeg(&mut self) -> DomainResult<Vec<u8>> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            if let Some(frame) = extract_frame(&mut self.buffer) {
                return Ok(frame);
            }
            if self.buffer.len() > MAX_FRAME_BYTES {
                self.buffer.clear();
                return Err(DomainError::ReadFailure(format!(
                    "no end of image within {MAX_FRAME_BYTES} bytes"
                )));
            }
            let n = self
                .reader
                .read(&mut chunk)
                .map_err(|e| DomainError::ReadFailure(e.to_string()))?;
            if n == 0 {
                return Err(DomainError::ReadFailure("stream ended".into()));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

impl CaptureDevice for MjpegReader<Response> {
    fn read(&mut self) -> DomainResult<CapturedImage> {
        self.next_jpeg().map(CapturedImage::Jpeg)
    }
}

fn extract_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let Some(start) = find_marker(buffer, &SOI) else {
        // Keep a trailing 0xFF in case the marker is split across reads.
        let keep_from = buffer.len().saturating_sub(1);
        buffer.drain(..keep_from);
        return None;
    };
    if start > 0 {
        buffer.drain(..start);
    }

    let end = find_marker(&buffer[SOI.len()..], &EOI)? + SOI.len();
    let frame_end = end + EOI.len();
    let frame = buffer[..frame_end].to_vec();
    buffer.drain(..frame_end);
    Some(frame)
}

fn find_marker(buffer: &[u8], marker: &[u8]) -> Option<usize> {
    buffer.windows(marker.len()).position(|window| window == marker)
}
