use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::application::camera_source::{CameraSource, StopSignal, DEFAULT_READ_TIMEOUT};
use crate::application::frame_slot::{FrameHub, FrameSubscription};
use crate::application::ports::{CameraLease, CaptureBackend, FrameCodec};
use crate::application::reconnect::{transition, ReconnectSupervisor, SupervisorExit};
use crate::domain::{
    camera::{CameraAddress, CameraState, ReconnectPolicy},
    errors::{DomainError, DomainResult},
};

/// What a viewer gets for holding the camera: its own frame slot and the camera state.
pub struct CameraFeed {
    pub frames: FrameSubscription,
    pub state: watch::Receiver<CameraState>,
}

struct AcquisitionWorker {
    stop: Arc<StopSignal>,
    // Hands the source back so a handle stuck in a read is remembered across activations.
    handle: JoinHandle<CameraSource>,
}

#[derive(Default)]
struct Activation {
    holders: usize,
    worker: Option<AcquisitionWorker>,
    idle: Option<CameraSource>,
}

/// Sole owner of the camera. Starts acquisition on the first holder and
/// releases the hardware when the last one leaves.
pub struct CameraLifecycleManager {
    backend: Arc<dyn CaptureBackend>,
    codec: Arc<dyn FrameCodec>,
    address: CameraAddress,
    policy: ReconnectPolicy,
    read_timeout: Duration,
    hub: Arc<FrameHub>,
    state: Arc<watch::Sender<CameraState>>,
    // Held across start/stop so 0->1 and 1->0 never interleave.
    activation: Mutex<Activation>,
}

impl CameraLifecycleManager {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        codec: Arc<dyn FrameCodec>,
        address: CameraAddress,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(CameraState::Stopped);
        Self {
            backend,
            codec,
            address,
            policy,
            read_timeout: DEFAULT_READ_TIMEOUT,
            hub: FrameHub::new(),
            state: Arc::new(state),
            activation: Mutex::new(Activation::default()),
        }
    }

    /// Longest a single read may block before it counts as a read failure.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    #[cfg(test)]
    pub async fn holders(&self) -> usize {
        self.activation.lock().await.holders
    }

    /// Opens the camera off the runtime and hands it to a dedicated acquisition thread.
    async fn start(&self, activation: &mut Activation) -> DomainResult<()> {
        transition(&self.state, CameraState::Starting);
        let mut source = match activation.idle.take() {
            Some(source) => source,
            None => CameraSource::new(self.backend.clone(), self.codec.clone(), self.address.clone())
                .with_read_timeout(self.read_timeout),
        };
        let (source, opened) = tokio::task::spawn_blocking(move || {
            let opened = source.open();
            (source, opened)
        })
        .await
        .map_err(|e| DomainError::OperationFailed(format!("camera open task failed: {e}")))?;

        let first = match opened {
            Ok(first) => first,
            Err(err) => {
                activation.idle = Some(source);
                transition(&self.state, CameraState::Stopped);
                return Err(err);
            }
        };
        self.hub.publish(first);

        let stop = Arc::new(StopSignal::new());
        let supervisor = ReconnectSupervisor::new(self.policy, self.state.clone());
        let hub = self.hub.clone();
        let thread_stop = stop.clone();
        let mut source = source;
        let handle = std::thread::Builder::new()
            .name("camera-acquisition".into())
            .spawn(move || {
                match supervisor.supervise(&mut source, &hub, thread_stop.as_ref()) {
                    SupervisorExit::Stopped => info!("acquisition thread finished"),
                    SupervisorExit::Exhausted(err) => error!(error = %err, "acquisition thread gave up"),
                }
                source
            })
            .map_err(|e| {
                transition(&self.state, CameraState::Stopped);
                DomainError::OperationFailed(format!("failed to spawn acquisition thread: {e}"))
            })?;

        activation.worker = Some(AcquisitionWorker { stop, handle });
        Ok(())
    }

    /// Stops the thread and waits until it has let go of the hardware.
    /// Bounded: a read that never returns is abandoned, not waited on.
    async fn stop(&self, activation: &mut Activation) {
        let Some(worker) = activation.worker.take() else {
            return;
        };
        worker.stop.stop();
        let handle = worker.handle;
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(source)) => activation.idle = Some(source),
            Ok(Err(_)) => error!("acquisition thread panicked"),
            Err(e) => error!(error = %e, "failed to join acquisition thread"),
        }
        if !self.state.borrow().is_failed() {
            transition(&self.state, CameraState::Stopped);
        }
    }
}

#[async_trait]
impl CameraLease for CameraLifecycleManager {
    async fn acquire(&self) -> DomainResult<CameraFeed> {
        let mut activation = self.activation.lock().await;
        if self.state.borrow().is_failed() {
            return Err(DomainError::ReconnectExhausted {
                attempts: self.policy.max_attempts,
            });
        }
        // Subscribe first so the first frame published by start() lands in this slot.
        let frames = self.hub.subscribe();
        if activation.holders == 0 {
            self.start(&mut activation).await?;
            info!(address = %self.address, "camera started");
        }
        activation.holders += 1;
        Ok(CameraFeed {
            frames,
            state: self.state.subscribe(),
        })
    }

    async fn release(&self) {
        let mut activation = self.activation.lock().await;
        if activation.holders == 0 {
            warn!("camera release without a matching acquire");
            return;
        }
        activation.holders -= 1;
        if activation.holders == 0 {
            self.stop(&mut activation).await;
            info!(address = %self.address, "camera stopped; no viewers left");
        }
    }

    fn state(&self) -> CameraState {
        *self.state.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::camera_source::testing::*;
    use std::sync::atomic::Ordering;
    use std::time::Instant;
    use tokio::sync::Barrier;
    use tokio::time::timeout;

    fn manager(backend: Arc<ScriptedBackend>, max_attempts: u32) -> Arc<CameraLifecycleManager> {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            max_attempts,
        };
        manager_with(backend, policy, Duration::from_millis(100))
    }

    fn manager_with(
        backend: Arc<ScriptedBackend>,
        policy: ReconnectPolicy,
        read_timeout: Duration,
    ) -> Arc<CameraLifecycleManager> {
        Arc::new(
            CameraLifecycleManager::new(
                backend,
                Arc::new(PassthroughCodec),
                CameraAddress("/dev/video9".into()),
                policy,
            )
            .with_read_timeout(read_timeout),
        )
    }

    #[tokio::test]
    async fn first_acquire_starts_and_delivers_a_frame() {
        let backend = ScriptedBackend::new(vec![]);
        let cam = manager(backend.clone(), 3);

        let feed = cam.acquire().await.expect("acquire");
        let frame = timeout(Duration::from_secs(1), feed.frames.next_frame())
            .await
            .expect("first frame");
        assert!(frame.sequence >= 1);
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);

        drop(feed);
        cam.release().await;
        assert_eq!(cam.state(), CameraState::Stopped);
        assert_eq!(backend.live_handles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn acquisition_error_reaches_caller_and_leaves_count_at_zero() {
        let backend = ScriptedBackend::new(vec![None]);
        let cam = manager(backend, 3);
        let err = cam.acquire().await.err().expect("acquire must fail");
        assert!(matches!(err, DomainError::Acquisition(_)));
        assert_eq!(cam.holders().await, 0);
        assert_eq!(cam.state(), CameraState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_holders_share_one_start_and_one_stop() {
        const HOLDERS: usize = 8;
        let backend = ScriptedBackend::new(vec![]);
        let cam = manager(backend.clone(), 3);

        for _cycle in 0..3 {
            // nobody releases until all holders are in, so each cycle is one activation
            let all_in = Arc::new(Barrier::new(HOLDERS));
            let mut tasks = Vec::new();
            for _ in 0..HOLDERS {
                let cam = cam.clone();
                let all_in = all_in.clone();
                tasks.push(tokio::spawn(async move {
                    let feed = cam.acquire().await.expect("acquire");
                    all_in.wait().await;
                    drop(feed);
                    cam.release().await;
                }));
            }
            for t in tasks {
                t.await.expect("holder task");
            }
            assert_eq!(cam.holders().await, 0);
            assert_eq!(backend.live_handles.load(Ordering::SeqCst), 0, "hardware released at zero");
            assert_eq!(cam.state(), CameraState::Stopped);
        }
        assert_eq!(backend.opens.load(Ordering::SeqCst), 3);
        assert_eq!(backend.max_live_handles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_activations_start_once_each() {
        let backend = ScriptedBackend::new(vec![]);
        let cam = manager(backend.clone(), 3);

        let a = cam.acquire().await.expect("a");
        let b = cam.acquire().await.expect("b");
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
        drop(a);
        cam.release().await;
        assert_eq!(backend.live_handles.load(Ordering::SeqCst), 1, "still one holder");
        drop(b);
        cam.release().await;
        assert_eq!(backend.live_handles.load(Ordering::SeqCst), 0);

        let c = cam.acquire().await.expect("c");
        assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
        drop(c);
        cam.release().await;
    }

    #[tokio::test]
    async fn exhausted_camera_rejects_new_holders() {
        // initial open succeeds, first loop read fails, both reopens fail
        let backend = ScriptedBackend::new(vec![Some(vec![Step::Frame, Step::Fail]), None, None]);
        let cam = manager(backend, 2);

        let mut feed = cam.acquire().await.expect("acquire");
        timeout(Duration::from_secs(2), feed.state.wait_for(|s| s.is_failed()))
            .await
            .expect("camera fails in time")
            .expect("state sender alive");

        assert!(matches!(
            cam.acquire().await.err(),
            Some(DomainError::ReconnectExhausted { attempts: 2 })
        ));
        drop(feed);
        cam.release().await;
        assert_eq!(cam.state(), CameraState::Failed);
    }

    #[tokio::test]
    async fn stalled_read_triggers_reconnect_and_recovers_once_the_device_lets_go() {
        let backend = ScriptedBackend::new(vec![Some(vec![Step::Frame, Step::Frame, Step::Hang])]);
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            max_attempts: 20,
        };
        let cam = manager_with(backend.clone(), policy, Duration::from_millis(100));

        let mut feed = cam.acquire().await.expect("acquire");
        timeout(
            Duration::from_secs(2),
            feed.state.wait_for(|s| matches!(s, CameraState::Reconnecting { .. })),
        )
        .await
        .expect("stall detected in time")
        .expect("state sender alive");

        backend.unhang.stop();
        timeout(Duration::from_secs(3), feed.state.wait_for(|s| *s == CameraState::Running))
            .await
            .expect("camera recovers")
            .expect("state sender alive");
        assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
        assert_eq!(backend.max_live_handles.load(Ordering::SeqCst), 1);

        drop(feed);
        timeout(Duration::from_secs(2), cam.release())
            .await
            .expect("release completes");
        assert_eq!(backend.live_handles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn release_is_not_held_hostage_by_a_hung_read() {
        let backend = ScriptedBackend::new(vec![Some(vec![Step::Frame, Step::Hang])]);
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            max_attempts: 3,
        };
        let cam = manager_with(backend.clone(), policy, Duration::from_secs(30));

        let feed = cam.acquire().await.expect("acquire");
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(feed);
        timeout(Duration::from_secs(3), cam.release())
            .await
            .expect("release completes while the read is hung");
        assert_eq!(cam.state(), CameraState::Stopped);
        assert_eq!(cam.holders().await, 0);

        // the hung read still owns the hardware, so a new viewer is refused instead of opening twice
        assert!(matches!(cam.acquire().await.err(), Some(DomainError::Acquisition(_))));
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);

        backend.unhang.stop();
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            match cam.acquire().await {
                Ok(feed) => {
                    drop(feed);
                    cam.release().await;
                    break;
                }
                Err(_) => {
                    assert!(Instant::now() < deadline, "camera usable once the read returned");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
        assert_eq!(backend.max_live_handles.load(Ordering::SeqCst), 1);
        assert_eq!(backend.live_handles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_release_is_ignored() {
        let cam = manager(ScriptedBackend::new(vec![]), 1);
        cam.release().await;
        assert_eq!(cam.holders().await, 0);
    }
}
