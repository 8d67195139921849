//! GPIO input/output monitor
//!
//! One pass per tick: read every input, record level changes, fire a dial on
//! a push-to-talk press, then drive the registration and call LEDs from the
//! current shared state.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audio::{playback_level, AudioPlayer};
use crate::call::Dialer;
use crate::config::{DeviceConfig, GpioConfig};
use crate::gpio::{drive_output, GpioPort};
use crate::scheduler::Wake;
use crate::state::{CallState, Level, PinId, SharedState};

/// Pin roles used by the monitor
#[derive(Debug, Clone)]
pub struct MonitorPins {
    pub inputs: Vec<PinId>,
    pub ptt: PinId,
    pub ptt_active: Level,
    pub registration_led: PinId,
    pub call_led: PinId,
}

impl From<&GpioConfig> for MonitorPins {
    fn from(config: &GpioConfig) -> Self {
        Self {
            inputs: config.inputs.clone(),
            ptt: config.ptt_pin,
            ptt_active: Level::from_bit(config.ptt_active_level),
            registration_led: config.registration_led,
            call_led: config.call_led,
        }
    }
}

/// Outcome of one pass, mostly for tests and debug logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dirty: Vec<PinId>,
    pub ptt_pressed: bool,
}

pub struct GpioMonitor {
    state: SharedState,
    gpio: Arc<dyn GpioPort>,
    pins: MonitorPins,
    dialer: Arc<Dialer>,
    audio: Arc<dyn AudioPlayer>,
    speaker_volume: u8,
    telemetry_wake: Option<Wake>,
    blink: Level,
    last_call_state: CallState,
}

impl GpioMonitor {
    pub fn new(
        state: SharedState,
        gpio: Arc<dyn GpioPort>,
        pins: MonitorPins,
        dialer: Arc<Dialer>,
        audio: Arc<dyn AudioPlayer>,
        device: &DeviceConfig,
    ) -> Self {
        Self {
            state,
            gpio,
            pins,
            dialer,
            audio,
            speaker_volume: device.speaker_volume,
            telemetry_wake: None,
            blink: Level::Low,
            last_call_state: CallState::Idle,
        }
    }

    /// Wake posted whenever an input changes
    pub fn with_telemetry_wake(mut self, wake: Wake) -> Self {
        self.telemetry_wake = Some(wake);
        self
    }

    /// Block on `wake` and tick until it is closed
    pub async fn run(mut self, wake: Wake) {
        info!("GPIO monitor started ({} inputs)", self.pins.inputs.len());
        while wake.wait().await {
            let report = self.tick().await;
            if !report.dirty.is_empty() {
                debug!("Inputs changed: {:?}", report.dirty);
            }
        }
        debug!("GPIO monitor stopped");
    }

    /// One polling pass
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        let previous = self.state.read(|s| s.inputs.clone());

        let mut changed = Vec::new();
        for &pin in &self.pins.inputs {
            match self.gpio.read(pin) {
                Ok(level) => {
                    if previous.get(&pin) != Some(&level) {
                        changed.push((pin, level));
                    }
                }
                Err(e) => warn!("Error while reading input {}: {}", pin, e),
            }
        }

        if !changed.is_empty() {
            self.state.update(|s| {
                for (pin, level) in &changed {
                    s.inputs.insert(*pin, *level);
                }
                s.pending_telemetry = true;
            });
        }
        report.dirty = changed.iter().map(|(pin, _)| *pin).collect();

        let ptt_inactive = self.pins.ptt_active.toggled();
        report.ptt_pressed = previous.get(&self.pins.ptt) == Some(&ptt_inactive)
            && changed
                .iter()
                .any(|(pin, level)| *pin == self.pins.ptt && *level == self.pins.ptt_active);

        if report.ptt_pressed {
            info!("Push-to-talk pressed");
            let outcome = self.dialer.dial_default().await;
            debug!("PTT dial outcome: {:?}", outcome);
        }

        self.drive_leds();
        self.apply_call_volume().await;

        if !report.dirty.is_empty() {
            if let Some(wake) = &self.telemetry_wake {
                wake.wake();
            }
        }

        report
    }

    fn drive_leds(&mut self) {
        self.blink = self.blink.toggled();
        let (registered, call_state) = self.state.read(|s| (s.registration.any(), s.call_state));

        let registration_level = if registered { Level::High } else { self.blink };
        drive_output(self.gpio.as_ref(), &self.state, self.pins.registration_led, registration_level);

        let call_level = match call_state {
            CallState::Active => Level::High,
            CallState::Dialing | CallState::Ringing => self.blink,
            CallState::Idle | CallState::Terminating => Level::Low,
        };
        drive_output(self.gpio.as_ref(), &self.state, self.pins.call_led, call_level);
    }

    async fn apply_call_volume(&mut self) {
        let call_state = self.state.read(|s| s.call_state);
        if call_state == CallState::Active && self.last_call_state != CallState::Active {
            let level = playback_level(self.speaker_volume);
            if let Err(e) = self.audio.set_playback_volume(level).await {
                warn!("Not able to set playback level {}: {}", level, e);
            }
        }
        self.last_call_state = call_state;
    }
}
