//! # Callbox Library
//!
//! Control core of a SIP intercom call box.
//!
//! Cooperating polling loops share one [`state::SharedState`]: a GPIO monitor
//! for buttons and LEDs, a network monitor that fails over between the primary
//! and secondary server, a call watchdog that restarts a stuck SIP user agent,
//! and a store-and-forward telemetry pipeline that never drops a sample.

pub mod app;
pub mod audio;
pub mod call;
pub mod config;
pub mod control;
pub mod error;
pub mod gpio;
pub mod network;
pub mod panel;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod telemetry;
pub mod timesync;
