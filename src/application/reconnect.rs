use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::application::camera_source::{CameraSource, Interrupt, LoopExit};
use crate::application::frame_slot::FrameHub;
use crate::domain::{
    camera::{CameraState, ReconnectPolicy},
    errors::DomainError,
};

#[derive(Debug)]
pub enum SupervisorExit {
    Stopped,
    Exhausted(DomainError),
}

enum Reopen {
    Restored,
    Stopped,
    Exhausted,
}

/// Drives a `CameraSource` through read failures with bounded exponential backoff.
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<CameraState>>,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy, state: Arc<watch::Sender<CameraState>>) -> Self {
        Self { policy, state }
    }

    /// Runs acquisition on an already open source until stopped or out of attempts.
    /// The source is closed on every exit path.
    pub fn supervise(
        &self,
        source: &mut CameraSource,
        hub: &FrameHub,
        interrupt: &dyn Interrupt,
    ) -> SupervisorExit {
        loop {
            transition(&self.state, CameraState::Running);
            match source.run_loop(hub, interrupt) {
                LoopExit::Stopped => {
                    source.close();
                    return SupervisorExit::Stopped;
                }
                LoopExit::ReadFailure(err) => warn!(error = %err, "camera read failed; reconnecting"),
            }
            match self.reopen(source, hub, interrupt) {
                Reopen::Restored => continue,
                Reopen::Stopped => {
                    source.close();
                    return SupervisorExit::Stopped;
                }
                Reopen::Exhausted => {
                    source.close();
                    transition(&self.state, CameraState::Failed);
                    error!(
                        attempts = self.policy.max_attempts,
                        "camera reconnect exhausted; stream unavailable until restart"
                    );
                    return SupervisorExit::Exhausted(DomainError::ReconnectExhausted {
                        attempts: self.policy.max_attempts,
                    });
                }
            }
        }
    }

    fn reopen(&self, source: &mut CameraSource, hub: &FrameHub, interrupt: &dyn Interrupt) -> Reopen {
        for attempt in 0..self.policy.max_attempts {
            if interrupt.is_stopped() {
                return Reopen::Stopped;
            }
            transition(&self.state, CameraState::Reconnecting { attempt: attempt + 1 });
            // open() releases the old handle before acquiring a new one
            match source.open() {
                Ok(first) => {
                    hub.publish(first);
                    info!(attempt = attempt + 1, "camera reconnected");
                    return Reopen::Restored;
                }
                Err(err) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "camera reopen failed"
                    );
                    if !interrupt.sleep(delay) {
                        return Reopen::Stopped;
                    }
                }
            }
        }
        Reopen::Exhausted
    }
}

pub(crate) fn transition(state: &watch::Sender<CameraState>, next: CameraState) {
    let previous = state.send_replace(next);
    if previous != next {
        info!(from = %previous, to = %next, "camera state changed");
    }
}
