//! Telemetry sample and its JSON wire body

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::{DeviceState, PinId};

/// Timestamp layout expected by the log server (local time, no zone)
pub const LOGDATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One status report
///
/// Serializes to
/// `{"macid":"..","data":{"din1":0,"din2":0,"din3":0,"din4":0,"psu":"..","rssi":0,"logdate":".."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub macid: String,
    pub data: SampleData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleData {
    pub din1: u8,
    pub din2: u8,
    pub din3: u8,
    pub din4: u8,
    pub psu: String,
    pub rssi: i32,
    pub logdate: String,
}

impl TelemetrySample {
    /// Build a sample from the current input levels
    ///
    /// `din_pins` maps din1..din4 in order; missing entries report 0.
    pub fn assemble(
        mac: &str,
        state: &DeviceState,
        din_pins: &[PinId],
        psu: &str,
        now: NaiveDateTime,
    ) -> Self {
        let din = |index: usize| {
            din_pins
                .get(index)
                .map(|pin| state.input_level(*pin).as_bit())
                .unwrap_or(0)
        };
        Self {
            macid: mac.to_string(),
            data: SampleData {
                din1: din(0),
                din2: din(1),
                din3: din(2),
                din4: din(3),
                psu: psu.to_string(),
                rssi: 0,
                logdate: now.format(LOGDATE_FORMAT).to_string(),
            },
        }
    }

    /// Serialized request body; one line, suitable for the local queue
    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `true` when `line` is a well-formed telemetry body
pub fn is_valid_body(line: &str) -> bool {
    serde_json::from_str::<TelemetrySample>(line).is_ok()
}
