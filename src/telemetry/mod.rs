//! # Telemetry Module
//!
//! Periodic status reports to the log server with store-and-forward.
//!
//! This module handles:
//! - Assembling samples as JSON bodies ([`sample`])
//! - HTTP/1.0 delivery and the server-time request ([`transport`])
//! - The durable local queue ([`queue`])
//! - Report, enqueue and guarded drain ([`pipeline`])

pub mod pipeline;
pub mod queue;
pub mod sample;
pub mod transport;

pub use pipeline::{DrainReport, PipelineSettings, ReportOutcome, TelemetryPipeline};
pub use queue::{LocalQueue, QueueEntry};
pub use sample::TelemetrySample;
pub use transport::{HttpTransport, TelemetryTransport};
