use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::application::alerts::AlertService;
use crate::application::annotator::DetectionAnnotator;
use crate::application::camera_lifecycle::CameraFeed;
use crate::application::ports::{CameraLease, Inbound, SessionSink, SessionStream};
use crate::domain::{
    camera::CameraState,
    frame::Frame,
    session::{CloseReason, SessionExit, SessionId},
};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct SessionEntry {
    admitted_at: Instant,
}

/// Live viewer sessions. Owns the admit/remove pairing that keeps the camera
/// reference count honest.
pub struct ConnectionRegistry {
    camera: Arc<dyn CameraLease>,
    annotator: Arc<DetectionAnnotator>,
    alerts: Arc<AlertService>,
    send_timeout: Duration,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    shutdown: watch::Sender<bool>,
    drained: Notify,
}

impl ConnectionRegistry {
    pub fn new(
        camera: Arc<dyn CameraLease>,
        annotator: Arc<DetectionAnnotator>,
        alerts: Arc<AlertService>,
        send_timeout: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            camera,
            annotator,
            alerts,
            send_timeout,
            sessions: Mutex::new(HashMap::new()),
            shutdown,
            drained: Notify::new(),
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn camera_state(&self) -> CameraState {
        self.camera.state()
    }

    /// Serves one viewer from handshake to close. Returns once the session is
    /// gone and its camera hold has been given back.
    pub async fn admit(
        self: &Arc<Self>,
        mut sink: Box<dyn SessionSink>,
        mut stream: Box<dyn SessionStream>,
    ) -> SessionExit {
        let id = SessionId::new();
        if !self.register(id).await {
            debug!(session = %id, "registry shutting down; viewer rejected");
            self.close_sink(id, sink.as_mut(), CloseReason::Normal).await;
            return SessionExit::Closed;
        }
        let mut ticket = SessionTicket::new(self.clone(), id);

        let mut feed = match self.camera.acquire().await {
            Ok(feed) => feed,
            Err(err) => {
                let reason = if err.is_camera_unavailable() {
                    CloseReason::CameraUnavailable
                } else {
                    CloseReason::InternalError
                };
                warn!(session = %id, error = %err, "camera acquire failed; closing viewer");
                self.close_sink(id, sink.as_mut(), reason).await;
                ticket.settle().await;
                return if reason == CloseReason::CameraUnavailable {
                    SessionExit::CameraFailed
                } else {
                    SessionExit::Fault(err.to_string())
                };
            }
        };
        ticket.acquired = true;
        info!(session = %id, "viewer admitted");

        let exit = match AssertUnwindSafe(self.run_session(id, sink.as_mut(), stream.as_mut(), &mut feed))
            .catch_unwind()
            .await
        {
            Ok(exit) => exit,
            Err(panic) => {
                let message = panic_message(panic);
                error!(session = %id, panic = %message, "viewer session panicked");
                SessionExit::Fault(message)
            }
        };
        drop(feed);
        self.close_sink(id, sink.as_mut(), exit.close_reason()).await;
        ticket.settle().await;
        info!(session = %id, exit = ?exit, "viewer removed");
        exit
    }

    /// Stops admitting, ends every live session and waits until all of them
    /// have released the camera.
    pub async fn shutdown(&self) {
        {
            let _sessions = self.sessions.lock().await;
            self.shutdown.send_replace(true);
        }
        loop {
            let drained = self.drained.notified();
            if self.sessions.lock().await.is_empty() {
                break;
            }
            drained.await;
        }
        info!("viewer registry drained");
    }

    async fn register(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        if *self.shutdown.borrow() {
            return false;
        }
        sessions.insert(id, SessionEntry { admitted_at: Instant::now() });
        true
    }

    /// Unregisters and, if the session held the camera, releases it. Only ever
    /// reached through a `SessionTicket`, which fires once.
    async fn remove(self: Arc<Self>, id: SessionId, acquired: bool) {
        if acquired {
            self.camera.release().await;
        }
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.remove(&id) {
            debug!(session = %id, secs = entry.admitted_at.elapsed().as_secs(), "session unregistered");
        }
        if sessions.is_empty() {
            self.drained.notify_waiters();
        }
    }

    async fn run_session(
        &self,
        id: SessionId,
        sink: &mut dyn SessionSink,
        stream: &mut dyn SessionStream,
        feed: &mut CameraFeed,
    ) -> SessionExit {
        let mut shutdown = self.shutdown.subscribe();
        let mut sent: u64 = 0;
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    debug!(session = %id, sent, "viewer closed by registry shutdown");
                    return SessionExit::Closed;
                }
                _ = camera_failed(&mut feed.state) => {
                    warn!(session = %id, sent, "camera failed; closing viewer");
                    return SessionExit::CameraFailed;
                }
                inbound = stream.recv() => match inbound {
                    Inbound::Message => continue,
                    Inbound::Closed => return SessionExit::Closed,
                    Inbound::Error(err) => return SessionExit::TransportError(err),
                },
                frame = feed.frames.next_frame() => frame,
            };

            // A stalled peer must not pin the session: delivery stays
            // interruptible and the send itself is bounded.
            let delivery = self.deliver(sink, frame);
            tokio::pin!(delivery);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => {
                        debug!(session = %id, sent, "viewer closed by registry shutdown mid-send");
                        return SessionExit::Closed;
                    }
                    _ = camera_failed(&mut feed.state) => {
                        warn!(session = %id, sent, "camera failed; closing viewer");
                        return SessionExit::CameraFailed;
                    }
                    inbound = stream.recv() => match inbound {
                        Inbound::Message => continue,
                        Inbound::Closed => return SessionExit::Closed,
                        Inbound::Error(err) => return SessionExit::TransportError(err),
                    },
                    delivered = &mut delivery => match delivered {
                        Ok(()) => {
                            sent += 1;
                            break;
                        }
                        Err(err) => {
                            debug!(session = %id, sent, error = %err, "frame send failed");
                            return SessionExit::TransportError(err);
                        }
                    },
                }
            }
        }
    }

    async fn deliver(&self, sink: &mut dyn SessionSink, frame: Frame) -> Result<(), String> {
        let captured_at = frame.captured_at;
        let annotated = self.annotator.process(frame).await;
        if !annotated.detections.is_empty() {
            self.alerts.observe(&annotated.detections, captured_at);
        }
        match tokio::time::timeout(self.send_timeout, sink.send_binary(annotated.jpeg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("frame send exceeded {} ms", self.send_timeout.as_millis())),
        }
    }

    /// Closing writes to the peer too, so it is bounded like a send.
    async fn close_sink(&self, id: SessionId, sink: &mut dyn SessionSink, reason: CloseReason) {
        let bound = self.send_timeout.min(CLOSE_GRACE);
        if tokio::time::timeout(bound, sink.close(reason)).await.is_err() {
            debug!(session = %id, "close frame not written in time; dropping transport");
        }
    }
}

/// Fires the session's removal exactly once: explicitly via `settle`, or from
/// `Drop` if the admitting task was cancelled first. Removal runs on its own
/// task so that cancelling the caller cannot cut it short.
struct SessionTicket {
    registry: Arc<ConnectionRegistry>,
    id: SessionId,
    acquired: bool,
    settled: bool,
}

impl SessionTicket {
    fn new(registry: Arc<ConnectionRegistry>, id: SessionId) -> Self {
        Self {
            registry,
            id,
            acquired: false,
            settled: false,
        }
    }

    async fn settle(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        let removal = tokio::spawn(self.registry.clone().remove(self.id, self.acquired));
        if let Err(err) = removal.await {
            error!(session = %self.id, error = %err, "session removal task failed");
        }
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(self.registry.clone().remove(self.id, self.acquired));
            }
            Err(_) => error!(session = %self.id, "session dropped outside the runtime; removal skipped"),
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let requested = rx.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

async fn camera_failed(rx: &mut watch::Receiver<CameraState>) {
    let failed = rx.wait_for(|state| state.is_failed()).await.is_ok();
    if !failed {
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
