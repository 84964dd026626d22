use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::device::{DeviceState, DeviceStateListener};
use crate::error::{DeviceError, ItsError, Result};

/// Queues device state transitions so the dispatcher can wait for a
/// specific one without missing transitions reported before it started
/// waiting.
#[derive(Default)]
pub struct StateWaiter {
    states: Mutex<VecDeque<DeviceState>>,
    notify: Notify,
}

impl StateWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget transitions that nobody waited for
    pub fn clear(&self) {
        self.states.lock().clear();
    }

    /// Consume queued transitions until `target` is seen. Transitions to
    /// other states are skipped; a device error ends the wait.
    pub async fn wait_for_state(&self, target: DeviceState, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let mut states = self.states.lock();
                while let Some(state) = states.pop_front() {
                    if state == target {
                        debug!("Device reached {:?}", target);
                        return Ok(());
                    }
                    if state == DeviceState::Error {
                        return Err(DeviceError::Configuration {
                            details: format!("device reported an error while waiting for {:?}", target),
                        }
                        .into());
                    }
                    trace!("Skipping device state {:?} while waiting for {:?}", state, target);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ItsError::timeout(
                    format!("device state {:?}", target),
                    timeout,
                ));
            }
        }
    }
}

impl DeviceStateListener for StateWaiter {
    fn on_state_changed(&self, state: DeviceState) {
        trace!("Device state changed to {:?}", state);
        self.states.lock().push_back(state);
        self.notify.notify_one();
    }
}
