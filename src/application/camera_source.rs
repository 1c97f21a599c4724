use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::application::frame_slot::FrameHub;
use crate::application::lock_unpoisoned;
use crate::application::ports::{CaptureBackend, CaptureDevice, CapturedImage, FrameCodec};
use crate::domain::{
    camera::CameraAddress,
    errors::{DomainError, DomainResult},
    frame::Frame,
};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
const RELEASE_GRACE: Duration = Duration::from_secs(1);
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Lets the acquisition thread be stopped between reads and woken out of backoff sleeps.
pub trait Interrupt: Send + Sync {
    fn is_stopped(&self) -> bool;
    /// Sleeps for `delay` unless stopped first. Returns false if stopped.
    fn sleep(&self, delay: Duration) -> bool;
}

#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        *lock_unpoisoned(&self.stopped) = true;
        self.wake.notify_all();
    }
}

impl Interrupt for StopSignal {
    fn is_stopped(&self) -> bool {
        *lock_unpoisoned(&self.stopped)
    }

    fn sleep(&self, delay: Duration) -> bool {
        let guard = lock_unpoisoned(&self.stopped);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, delay, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !*guard
    }
}

#[derive(Debug)]
pub enum LoopExit {
    Stopped,
    ReadFailure(DomainError),
}

/// An open device parked on its own thread. Reads are requested over a
/// channel, so a driver call that never returns only costs a timeout.
struct DeviceReader {
    requests: Sender<()>,
    results: Receiver<DomainResult<CapturedImage>>,
    // Disconnects once the reader thread has dropped the device.
    released: Receiver<()>,
}

impl DeviceReader {
    fn spawn(mut device: Box<dyn CaptureDevice>) -> DomainResult<Self> {
        let (requests, pending) = mpsc::channel::<()>();
        let (deliver, results) = mpsc::sync_channel(1);
        let (release_tx, released) = mpsc::channel::<()>();
        std::thread::Builder::new()
            .name("camera-reader".into())
            .spawn(move || {
                while pending.recv().is_ok() {
                    if deliver.send(device.read()).is_err() {
                        break;
                    }
                }
                drop(device);
                drop(release_tx);
            })
            .map_err(|e| DomainError::Acquisition(format!("failed to spawn camera reader: {e}")))?;
        Ok(Self {
            requests,
            results,
            released,
        })
    }

    /// One read, waited on for at most `timeout`. A stop request abandons the wait.
    fn read(&self, timeout: Duration, interrupt: Option<&dyn Interrupt>) -> DomainResult<CapturedImage> {
        self.requests
            .send(())
            .map_err(|_| DomainError::ReadFailure("camera reader exited".into()))?;
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(DomainError::ReadFailure(format!(
                    "no frame within {} ms",
                    timeout.as_millis()
                )));
            }
            match self.results.recv_timeout(left.min(POLL_SLICE)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DomainError::ReadFailure("camera reader exited".into()))
                }
                Err(RecvTimeoutError::Timeout) => {
                    if interrupt.is_some_and(|i| i.is_stopped()) {
                        return Err(DomainError::ReadFailure("read abandoned on stop".into()));
                    }
                }
            }
        }
    }

    /// Hangs up and waits up to `grace` for the device to be dropped.
    /// Returns the release signal when the reader is still stuck in a read.
    fn shut(self, grace: Duration) -> Option<Receiver<()>> {
        let Self {
            requests,
            results,
            released,
        } = self;
        drop(requests);
        drop(results);
        match released.recv_timeout(grace) {
            Err(RecvTimeoutError::Timeout) => Some(released),
            _ => None,
        }
    }
}

/// Owns the camera handle and turns reads into published frames.
/// Runs on the acquisition thread only; never retries on its own.
pub struct CameraSource {
    backend: Arc<dyn CaptureBackend>,
    codec: Arc<dyn FrameCodec>,
    address: CameraAddress,
    read_timeout: Duration,
    device: Option<DeviceReader>,
    // Set while an abandoned reader still holds the previous handle.
    stuck: Option<Receiver<()>>,
    sequence: u64,
}

impl CameraSource {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        codec: Arc<dyn FrameCodec>,
        address: CameraAddress,
    ) -> Self {
        Self {
            backend,
            codec,
            address,
            read_timeout: DEFAULT_READ_TIMEOUT,
            device: None,
            stuck: None,
            sequence: 0,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Acquires the handle and proves it yields data. Returns that first frame.
    ///
    /// Refuses while a previous handle is still wedged in a read, so the
    /// hardware is never held twice.
    pub fn open(&mut self) -> DomainResult<Frame> {
        self.close();
        self.ensure_released()?;
        let device = self
            .backend
            .open(&self.address)
            .map_err(|e| DomainError::Acquisition(format!("{}: {}", self.address, e)))?;
        let reader = DeviceReader::spawn(device)?;
        match reader.read(self.read_timeout, None).and_then(|image| self.encode(image)) {
            Ok(first) => {
                self.device = Some(reader);
                info!(address = %self.address, bytes = first.jpeg.len(), "camera opened");
                Ok(first)
            }
            Err(e) => {
                self.park(reader);
                Err(DomainError::Acquisition(format!(
                    "{} opened but yielded no frame: {}",
                    self.address, e
                )))
            }
        }
    }

    /// One bounded read + encode. A failure is returned, never retried here.
    pub fn read_frame(&mut self, interrupt: &dyn Interrupt) -> DomainResult<Frame> {
        let result = match self.device.as_ref() {
            Some(reader) => reader.read(self.read_timeout, Some(interrupt)),
            None => Err(DomainError::ReadFailure("camera is not open".into())),
        };
        result.and_then(|image| self.encode(image)).map_err(|err| match err {
            DomainError::ReadFailure(_) => err,
            other => DomainError::ReadFailure(other.to_string()),
        })
    }

    /// Reads and publishes until stopped or the first failed read.
    pub fn run_loop(&mut self, hub: &FrameHub, interrupt: &dyn Interrupt) -> LoopExit {
        let mut dropped = 0usize;
        loop {
            if interrupt.is_stopped() {
                debug!(dropped, "acquisition loop stopped");
                return LoopExit::Stopped;
            }
            match self.read_frame(interrupt) {
                Ok(frame) => dropped += hub.publish(frame),
                Err(_) if interrupt.is_stopped() => return LoopExit::Stopped,
                Err(err) => return LoopExit::ReadFailure(err),
            }
        }
    }

    /// Releases the handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(reader) = self.device.take() {
            self.park(reader);
        }
    }

    fn park(&mut self, reader: DeviceReader) {
        match reader.shut(self.read_timeout.min(RELEASE_GRACE)) {
            Some(released) => {
                warn!(address = %self.address, "camera handle stuck in a read; reopen deferred until it lets go");
                self.stuck = Some(released);
            }
            None => info!(address = %self.address, "camera released"),
        }
    }

    fn ensure_released(&mut self) -> DomainResult<()> {
        if let Some(released) = &self.stuck {
            if let Err(TryRecvError::Empty) = released.try_recv() {
                return Err(DomainError::Acquisition(format!(
                    "{}: previous handle is still blocked in a read",
                    self.address
                )));
            }
            info!(address = %self.address, "stuck camera handle let go");
            self.stuck = None;
        }
        Ok(())
    }

    fn encode(&mut self, image: CapturedImage) -> DomainResult<Frame> {
        let jpeg = match image {
            CapturedImage::Jpeg(bytes) => bytes,
            CapturedImage::Rgb(rgb) => self.codec.encode(&rgb)?,
        };
        if jpeg.is_empty() {
            return Err(DomainError::ReadFailure("empty frame".into()));
        }
        self.sequence += 1;
        Ok(Frame::new(jpeg, self.sequence))
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}
