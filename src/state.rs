//! # Shared Device State
//!
//! The single mutable record read by every polling loop. Each field has one
//! writer domain:
//!
//! | Domain | Fields |
//! |--------|--------|
//! | Network monitor | `link_up`, `server_reachable`, `active_server` |
//! | GPIO monitor | `inputs`, `outputs`, `pending_telemetry` (set) |
//! | Call watchdog | `call_state`, `registration`, `dial_failure_count` |
//! | Dialer | `dial_attempts` |
//! | Telemetry pipeline | `pending_telemetry` (clear), `panel_status` |
//!
//! The lock is never held across I/O: callers take a [`SharedState::snapshot`],
//! release, do their probe or delivery, then write results back through
//! [`SharedState::update`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// GPIO pin number (sysfs numbering)
pub type PinId = u32;

/// Logic level of a GPIO pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    /// Parse a sysfs value file's content (`"0"`/`"1"`, trailing newline allowed)
    pub fn from_sysfs(raw: &str) -> Option<Self> {
        match raw.trim() {
            "0" => Some(Level::Low),
            "1" => Some(Level::High),
            _ => None,
        }
    }

    pub fn from_bit(bit: u8) -> Self {
        if bit == 0 {
            Level::Low
        } else {
            Level::High
        }
    }

    pub fn as_bit(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl From<bool> for Level {
    fn from(on: bool) -> Self {
        if on {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Which configured server is the dial and telemetry target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerRole {
    #[default]
    Primary,
    Secondary,
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Primary => write!(f, "primary"),
            ServerRole::Secondary => write!(f, "secondary"),
        }
    }
}

/// Outbound call progress as reported by the call subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Dialing,
    Ringing,
    Active,
    Terminating,
}

impl CallState {
    /// A call is being set up or is connected
    pub fn in_progress(self) -> bool {
        matches!(self, CallState::Dialing | CallState::Ringing | CallState::Active)
    }
}

/// SIP registration status of both accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registration {
    pub primary: bool,
    pub secondary: bool,
}

impl Registration {
    pub fn any(&self) -> bool {
        self.primary || self.secondary
    }
}

/// The shared device record
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    /// Last observed level per monitored input
    pub inputs: HashMap<PinId, Level>,
    /// Last commanded level per output
    pub outputs: HashMap<PinId, Level>,
    pub registration: Registration,
    pub active_server: ServerRole,
    pub call_state: CallState,
    pub link_up: bool,
    pub server_reachable: bool,
    /// Consecutive watchdog ticks with a dial outstanding and no media session
    pub dial_failure_count: u32,
    /// Monotonic count of dial attempts issued
    pub dial_attempts: u64,
    pub pending_telemetry: bool,
    /// Last panel status string read for telemetry
    pub panel_status: String,
}

impl DeviceState {
    /// Fields published to the status snapshot file
    pub fn status_view(&self) -> StatusView {
        StatusView {
            primary_registered: self.registration.primary,
            link_up: self.link_up,
            primary_active: self.active_server == ServerRole::Primary,
            secondary_registered: self.registration.secondary,
        }
    }

    /// Input level, defaulting to low when the pin has not been read yet
    pub fn input_level(&self, pin: PinId) -> Level {
        self.inputs.get(&pin).copied().unwrap_or(Level::Low)
    }
}

/// Subset of state exported for external consumers such as a web UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusView {
    pub primary_registered: bool,
    pub link_up: bool,
    pub primary_active: bool,
    pub secondary_registered: bool,
}

/// Cloneable handle to the one `DeviceState` owned by the application
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<DeviceState>>,
}

impl SharedState {
    pub fn new(state: DeviceState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    // A worker that panicked mid-update leaves plain data behind; keep serving it.
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the whole record
    pub fn snapshot(&self) -> DeviceState {
        self.lock().clone()
    }

    /// Read a projection without cloning the whole record
    pub fn read<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate under the lock. `f` must not block.
    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.lock())
    }
}
