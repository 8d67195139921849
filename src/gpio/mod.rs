//! # GPIO Module
//!
//! Pin access for the call box board and the input/output monitor loop.
//!
//! This module handles:
//! - The [`GpioPort`] collaborator seam (`read`/`write` per pin)
//! - A sysfs implementation (`/sys/class/gpio`)
//! - Redundancy-aware output driving shared by every loop that owns an LED

pub mod monitor;

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{CallboxError, Result};
use crate::state::{Level, PinId, SharedState};

/// Pin direction used when exporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_sysfs(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Pin-level access to the board
pub trait GpioPort: Send + Sync {
    fn read(&self, pin: PinId) -> Result<Level>;

    fn write(&self, pin: PinId, level: Level) -> Result<()>;
}

/// GPIO through the legacy sysfs interface
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pin_file(&self, pin: PinId, name: &str) -> PathBuf {
        self.root.join(format!("gpio{}", pin)).join(name)
    }

    /// Export `pin` and set its direction
    ///
    /// An already-exported pin is not an error.
    pub fn export(&self, pin: PinId, direction: Direction) -> Result<()> {
        if !self.root.join(format!("gpio{}", pin)).exists() {
            match fs::write(self.root.join("export"), pin.to_string()) {
                Ok(()) => {}
                // EBUSY: exported by someone else in the meantime
                Err(e) if e.raw_os_error() == Some(16) => {}
                Err(e) => return Err(pin_error(pin, "export", e)),
            }
        }

        fs::write(self.pin_file(pin, "direction"), direction.as_sysfs())
            .map_err(|e| pin_error(pin, "set direction", e))?;
        debug!("Exported GPIO {} as {}", pin, direction.as_sysfs());
        Ok(())
    }

    /// Export every pin, logging failures; returns how many pins failed
    pub fn export_all(&self, inputs: &[PinId], outputs: &[PinId]) -> usize {
        let mut failures = 0;
        let pins = inputs
            .iter()
            .map(|pin| (*pin, Direction::In))
            .chain(outputs.iter().map(|pin| (*pin, Direction::Out)));
        for (pin, direction) in pins {
            if let Err(e) = self.export(pin, direction) {
                warn!("Not able to configure GPIO {}: {}", pin, e);
                failures += 1;
            }
        }
        failures
    }
}

fn pin_error(pin: PinId, action: &str, e: io::Error) -> CallboxError {
    CallboxError::Gpio {
        pin,
        message: format!("failed to {}: {}", action, e),
    }
}

impl GpioPort for SysfsGpio {
    fn read(&self, pin: PinId) -> Result<Level> {
        let raw = fs::read_to_string(self.pin_file(pin, "value"))
            .map_err(|e| pin_error(pin, "read value", e))?;
        Level::from_sysfs(&raw).ok_or_else(|| CallboxError::Gpio {
            pin,
            message: format!("unexpected value {:?}", raw.trim()),
        })
    }

    fn write(&self, pin: PinId, level: Level) -> Result<()> {
        fs::write(self.pin_file(pin, "value"), level.as_bit().to_string())
            .map_err(|e| pin_error(pin, "write value", e))
    }
}

/// Drive an output pin unless it already holds `level`
///
/// The commanded level is recorded in `outputs` only after the write
/// succeeds, so a failed write is retried on the next tick.
///
/// Returns `true` when a write was issued and succeeded.
pub fn drive_output(port: &dyn GpioPort, state: &SharedState, pin: PinId, level: Level) -> bool {
    let current = state.read(|s| s.outputs.get(&pin).copied());
    if current == Some(level) {
        return false;
    }

    match port.write(pin, level) {
        Ok(()) => {
            state.update(|s| s.outputs.insert(pin, level));
            true
        }
        Err(e) => {
            warn!("Error while driving output {}: {}", pin, e);
            false
        }
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    /// In-memory board for tests
    #[derive(Clone, Default)]
    pub struct MockGpio {
        pub levels: Arc<Mutex<HashMap<PinId, Level>>>,
        pub writes: Arc<Mutex<Vec<(PinId, Level)>>>,
        pub failing: Arc<Mutex<HashSet<PinId>>>,
    }

    impl MockGpio {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_level(&self, pin: PinId, level: Level) {
            self.levels.lock().unwrap().insert(pin, level);
        }

        pub fn fail_pin(&self, pin: PinId) {
            self.failing.lock().unwrap().insert(pin);
        }

        pub fn heal_pin(&self, pin: PinId) {
            self.failing.lock().unwrap().remove(&pin);
        }

        pub fn writes_to(&self, pin: PinId) -> Vec<Level> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| *p == pin)
                .map(|(_, level)| *level)
                .collect()
        }

        pub fn level(&self, pin: PinId) -> Option<Level> {
            self.levels.lock().unwrap().get(&pin).copied()
        }
    }

    impl GpioPort for MockGpio {
        fn read(&self, pin: PinId) -> Result<Level> {
            if self.failing.lock().unwrap().contains(&pin) {
                return Err(CallboxError::Gpio { pin, message: "mock read error".to_string() });
            }
            Ok(self.level(pin).unwrap_or(Level::Low))
        }

        fn write(&self, pin: PinId, level: Level) -> Result<()> {
            if self.failing.lock().unwrap().contains(&pin) {
                return Err(CallboxError::Gpio { pin, message: "mock write error".to_string() });
            }
            self.levels.lock().unwrap().insert(pin, level);
            self.writes.lock().unwrap().push((pin, level));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::MockGpio;
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(pins: &[PinId]) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        for pin in pins {
            let pin_dir = dir.path().join(format!("gpio{}", pin));
            fs::create_dir_all(&pin_dir).unwrap();
            fs::write(pin_dir.join("value"), "0\n").unwrap();
            fs::write(pin_dir.join("direction"), "in\n").unwrap();
        }
        dir
    }

    #[test]
    fn test_sysfs_read_and_write() {
        let dir = fake_sysfs(&[97, 129]);
        let gpio = SysfsGpio::new(dir.path());

        assert_eq!(gpio.read(129).unwrap(), Level::Low);
        gpio.write(97, Level::High).unwrap();
        assert_eq!(gpio.read(97).unwrap(), Level::High);
    }

    #[test]
    fn test_sysfs_read_missing_pin_is_error() {
        let dir = fake_sysfs(&[]);
        let gpio = SysfsGpio::new(dir.path());
        match gpio.read(42) {
            Err(CallboxError::Gpio { pin, .. }) => assert_eq!(pin, 42),
            other => panic!("Expected Gpio error, got: {:?}", other),
        }
    }

    #[test]
    fn test_sysfs_read_garbage_is_error() {
        let dir = fake_sysfs(&[129]);
        fs::write(dir.path().join("gpio129/value"), "banana").unwrap();
        let gpio = SysfsGpio::new(dir.path());
        assert!(gpio.read(129).is_err());
    }

    #[test]
    fn test_export_sets_direction() {
        let dir = fake_sysfs(&[99]);
        let gpio = SysfsGpio::new(dir.path());
        gpio.export(99, Direction::Out).unwrap();
        let direction = fs::read_to_string(dir.path().join("gpio99/direction")).unwrap();
        assert_eq!(direction, "out");
    }

    #[test]
    fn test_export_all_counts_failures() {
        let dir = fake_sysfs(&[129]);
        let gpio = SysfsGpio::new(dir.path());
        // 130 has no sysfs directory after "export", so setting direction fails
        assert_eq!(gpio.export_all(&[129, 130], &[]), 1);
    }

    #[test]
    fn test_drive_output_skips_redundant_writes() {
        let gpio = MockGpio::new();
        let state = SharedState::default();

        assert!(drive_output(&gpio, &state, 100, Level::High));
        assert!(!drive_output(&gpio, &state, 100, Level::High));
        assert!(drive_output(&gpio, &state, 100, Level::Low));
        assert_eq!(gpio.writes_to(100), vec![Level::High, Level::Low]);
    }

    #[test]
    fn test_drive_output_failure_is_retried() {
        let gpio = MockGpio::new();
        let state = SharedState::default();
        gpio.fail_pin(100);

        assert!(!drive_output(&gpio, &state, 100, Level::High));
        assert!(state.read(|s| s.outputs.get(&100).is_none()));

        gpio.heal_pin(100);
        assert!(drive_output(&gpio, &state, 100, Level::High));
        assert_eq!(state.read(|s| s.outputs.get(&100).copied()), Some(Level::High));
    }
}
