//! Call-state watchdog
//!
//! Mirrors the call subsystem's state into [`DeviceState`] and escalates a
//! dial that never reaches a media session into a full restart of the
//! call subsystem.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::call::{CallControl, CallSnapshot};
use crate::gpio::{drive_output, GpioPort};
use crate::scheduler::Wake;
use crate::state::{CallState, Level, PinId, Registration, SharedState};
use crate::status::StatusFile;

/// What a single tick decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// No dial outstanding
    Idle,
    /// Media session is up
    Connected,
    /// Dial outstanding without media; carries the failure count
    Waiting(u32),
    /// Threshold reached, call subsystem restarted
    Restarted,
}

pub struct CallWatchdog {
    state: SharedState,
    call: Arc<dyn CallControl>,
    gpio: Arc<dyn GpioPort>,
    call_led: PinId,
    threshold: u32,
    status: Option<Arc<StatusFile>>,
    seen_attempts: u64,
    dial_pending: bool,
}

impl CallWatchdog {
    pub fn new(
        state: SharedState,
        call: Arc<dyn CallControl>,
        gpio: Arc<dyn GpioPort>,
        call_led: PinId,
        threshold: u32,
    ) -> Self {
        let seen_attempts = state.read(|s| s.dial_attempts);
        Self {
            state,
            call,
            gpio,
            call_led,
            threshold: threshold.max(1),
            status: None,
            seen_attempts,
            dial_pending: false,
        }
    }

    pub fn with_status(mut self, status: Arc<StatusFile>) -> Self {
        self.status = Some(status);
        self
    }

    /// Block on `wake` and tick until it is closed
    pub async fn run(mut self, wake: Wake) {
        info!("Call watchdog started (threshold {})", self.threshold);
        while wake.wait().await {
            self.tick().await;
        }
        debug!("Call watchdog stopped");
    }

    /// One polling pass
    pub async fn tick(&mut self) -> WatchdogAction {
        let snapshot = self.call.snapshot();
        let (attempts, link_up) = self.state.read(|s| (s.dial_attempts, s.link_up));

        if attempts != self.seen_attempts {
            self.seen_attempts = attempts;
            self.dial_pending = true;
        }

        let action = self.decide(&snapshot, link_up);

        if action == WatchdogAction::Connected {
            drive_output(self.gpio.as_ref(), &self.state, self.call_led, Level::High);
        }

        if action == WatchdogAction::Restarted {
            if let Err(e) = self.call.restart().await {
                error!("Call subsystem restart failed: {}", e);
            }
        }

        if let Some(status) = &self.status {
            let view = self.state.read(|s| s.status_view());
            status.publish(view).await;
        }

        action
    }

    fn decide(&mut self, snapshot: &CallSnapshot, link_up: bool) -> WatchdogAction {
        let threshold = self.threshold;
        let dial_pending = self.dial_pending;

        let action = self.state.update(|s| {
            s.registration = if link_up {
                snapshot.registration
            } else {
                Registration::default()
            };

            if snapshot.media_active {
                if s.call_state != CallState::Active {
                    info!("Call connected");
                }
                s.call_state = CallState::Active;
                s.dial_failure_count = 0;
                return WatchdogAction::Connected;
            }

            s.call_state = snapshot.call_state;

            if !dial_pending {
                s.dial_failure_count = 0;
                return WatchdogAction::Idle;
            }

            s.dial_failure_count += 1;
            if s.dial_failure_count >= threshold {
                s.dial_failure_count = 0;
                s.call_state = CallState::Idle;
                WatchdogAction::Restarted
            } else {
                WatchdogAction::Waiting(s.dial_failure_count)
            }
        });

        match action {
            WatchdogAction::Connected | WatchdogAction::Restarted => self.dial_pending = false,
            WatchdogAction::Waiting(count) => debug!("No media session after dial ({}/{})", count, threshold),
            WatchdogAction::Idle => {}
        }
        if action == WatchdogAction::Restarted {
            warn!("No media session after {} checks, restarting call subsystem", threshold);
        }

        action
    }
}
