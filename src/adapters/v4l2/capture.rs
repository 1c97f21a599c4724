use std::time::Duration;

use anyhow::{anyhow, Result};
use image::RgbImage;
use v4l::buffer::Type;
use v4l::format::FourCC;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::application::ports::{CaptureBackend, CaptureDevice, CapturedImage};
use crate::domain::{
    camera::{CameraAddress, CaptureMode},
    errors::{DomainError, DomainResult},
};

const MMAP_BUFFERS: u32 = 4;

/// Opens `/dev/videoN` style addresses with the configured capture mode.
pub struct V4l2Backend {
    mode: CaptureMode,
    read_timeout: Duration,
}

impl V4l2Backend {
    pub fn new(mode: CaptureMode, read_timeout: Duration) -> Self {
        Self { mode, read_timeout }
    }
}

impl CaptureBackend for V4l2Backend {
    fn open(&self, address: &CameraAddress) -> DomainResult<Box<dyn CaptureDevice>> {
        let capture = V4l2Capture::open(address.as_str(), &self.mode, self.read_timeout)
            .map_err(|e| DomainError::Acquisition(e.to_string()))?;
        Ok(Box::new(capture))
    }
}

/// An MMAP capture stream. Dropping it stops streaming and closes the device.
pub struct V4l2Capture {
    // Declared before the device so it is torn down first.
    stream: Stream<'static>,
    _device: Device,
    fourcc: FourCC,
    width: u32,
    height: u32,
}

impl V4l2Capture {
    pub fn open(path: &str, mode: &CaptureMode, read_timeout: Duration) -> Result<Self> {
        let device = Device::with_path(path)?;

        let mut fmt = device.format()?;
        let b = mode.fourcc.as_bytes();
        if b.len() != 4 {
            return Err(anyhow!("fourcc must be 4 characters, got {:?}", mode.fourcc));
        }
        fmt.fourcc = FourCC::new(&[b[0], b[1], b[2], b[3]]);
        fmt.width = mode.size.width;
        fmt.height = mode.size.height;
        // The driver may round to the closest supported mode.
        let actual = device.set_format(&fmt)?;

        let mut params = device.params()?;
        params.interval.numerator = 1;
        params.interval.denominator = mode.fps.max(1);
        if let Err(e) = device.set_params(&params) {
            tracing::warn!(path, fps = mode.fps, error = %e, "driver rejected frame interval");
        }

        // The stream keeps its own handle to the device file.
        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, MMAP_BUFFERS)?;
        // Dequeue polls instead of blocking forever on a wedged driver.
        stream.set_timeout(read_timeout);

        tracing::info!(
            path,
            width = actual.width,
            height = actual.height,
            fourcc = %actual.fourcc,
            fps = mode.fps,
            "v4l2 capture opened"
        );

        Ok(Self {
            stream,
            _device: device,
            fourcc: actual.fourcc,
            width: actual.width,
            height: actual.height,
        })
    }

    fn next_image(&mut self) -> Result<CapturedImage> {
        let (data, _) = self.stream.next()?;
        let fourcc = self.fourcc.str().map_err(|_| anyhow!("invalid fourcc"))?;

        match fourcc {
            // MJPG buffers are complete JPEGs already.
            "MJPG" => Ok(CapturedImage::Jpeg(data.to_vec())),
            "YUYV" => Ok(CapturedImage::Rgb(yuyv_to_rgb(data, self.width, self.height))),
            other => Err(anyhow!("pixel format {other} is not supported")),
        }
    }
}

impl CaptureDevice for V4l2Capture {
    fn read(&mut self) -> DomainResult<CapturedImage> {
        self.next_image().map_err(|e| DomainError::ReadFailure(e.to_string()))
    }
}

/// YUYV (YUV 4:2:2) to RGB, BT.601.
fn yuyv_to_rgb(yuyv: &[u8], w: u32, h: u32) -> RgbImage {
    let mut out = RgbImage::new(w, h);
    if w == 0 {
        return out;
    }

    // Each 4-byte block [Y0, U, Y1, V] covers two pixels sharing U and V.
    for (i, chunk) in yuyv.chunks_exact(4).enumerate() {
        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;

        let pixel_idx = i as u32 * 2;
        let x = pixel_idx % w;
        let y = pixel_idx / w;
        if y >= h {
            break;
        }
        out.put_pixel(x, y, yuv_pixel(y0, u, v));
        if x + 1 < w {
            out.put_pixel(x + 1, y, yuv_pixel(y1, u, v));
        }
    }
    out
}

fn yuv_pixel(y: f32, u: f32, v: f32) -> image::Rgb<u8> {
    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
    image::Rgb([r, g, b])
}
