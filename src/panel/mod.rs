//! # Panel Module
//!
//! Reads the power-supply panel status over its serial TTL line.
//!
//! This module handles:
//! - Opening the panel port at the configured baud rate (8N1)
//! - The query/response exchange: write the query char, wait for the start
//!   char, collect until the end char
//! - Falling back to [`PANEL_UNAVAILABLE`] when the panel does not answer

pub mod port_trait;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

use crate::config::PanelConfig;
use crate::error::{CallboxError, Result};
use port_trait::{SerialPortIO, TokioSerialPort};

/// Status reported when the panel cannot be read
pub const PANEL_UNAVAILABLE: &str = "psu:-1";

/// Longest status frame accepted between start and end chars
pub const MAX_FRAME_LEN: usize = 64;

/// External sensor reading attached to each telemetry sample
#[async_trait]
pub trait PanelReader: Send + Sync {
    async fn read_status(&self) -> Result<String>;
}

/// Frame delimiters of the panel protocol
#[derive(Debug, Clone, Copy)]
pub struct Framing {
    pub query: u8,
    pub start: u8,
    pub end: u8,
}

impl Framing {
    fn from_config(config: &PanelConfig) -> Result<Self> {
        let byte = |c: char| {
            u8::try_from(c).map_err(|_| CallboxError::Panel(format!("framing char {:?} is not one byte", c)))
        };
        Ok(Self {
            query: byte(config.query_char)?,
            start: byte(config.start_char)?,
            end: byte(config.end_char)?,
        })
    }
}

/// Run one query/response exchange on `port`
///
/// Bytes before the start char are discarded. The whole exchange is bounded
/// by `limit`.
pub async fn query_status<P>(port: &mut P, framing: Framing, limit: Duration) -> Result<String>
where
    P: SerialPortIO + ?Sized,
{
    port.write_all(&[framing.query])
        .await
        .map_err(|e| CallboxError::Panel(format!("Failed to write query: {}", e)))?;
    port.flush()
        .await
        .map_err(|e| CallboxError::Panel(format!("Failed to flush panel port: {}", e)))?;

    timeout(limit, read_frame(port, framing))
        .await
        .map_err(|_| CallboxError::Timeout(format!("panel did not answer within {:?}", limit)))?
}

async fn read_frame<P>(port: &mut P, framing: Framing) -> Result<String>
where
    P: SerialPortIO + ?Sized,
{
    let mut frame = Vec::new();
    let mut started = false;
    let mut buf = [0u8; 16];
    loop {
        let n = port
            .read(&mut buf)
            .await
            .map_err(|e| CallboxError::Panel(format!("Failed to read panel: {}", e)))?;
        if n == 0 {
            return Err(CallboxError::Panel("panel line closed".to_string()));
        }
        for &byte in &buf[..n] {
            if !started {
                started = byte == framing.start;
            } else if byte == framing.end {
                return Ok(String::from_utf8_lossy(&frame).trim().to_string());
            } else {
                frame.push(byte);
                if frame.len() > MAX_FRAME_LEN {
                    return Err(CallboxError::Panel("status frame too long".to_string()));
                }
            }
        }
    }
}

/// Panel on a local serial port, opened per read
#[derive(Debug, Clone)]
pub struct SerialPanel {
    config: PanelConfig,
}

impl SerialPanel {
    pub fn new(config: PanelConfig) -> Self {
        Self { config }
    }

    fn open_port(&self) -> Result<tokio_serial::SerialStream> {
        tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| CallboxError::Panel(format!("Failed to open {}: {}", self.config.port, e)))
    }
}

#[async_trait]
impl PanelReader for SerialPanel {
    async fn read_status(&self) -> Result<String> {
        let framing = Framing::from_config(&self.config)?;
        let mut port = TokioSerialPort::new(self.open_port()?);
        let status = query_status(
            &mut port,
            framing,
            Duration::from_millis(self.config.timeout_ms),
        )
        .await?;
        debug!("Panel status: {}", status);
        Ok(status)
    }
}

/// Read the panel, substituting [`PANEL_UNAVAILABLE`] on any failure
pub async fn status_or_unavailable(panel: Option<&dyn PanelReader>) -> String {
    let Some(panel) = panel else {
        return PANEL_UNAVAILABLE.to_string();
    };
    match panel.read_status().await {
        Ok(status) => status,
        Err(e) => {
            warn!("Panel read failed: {}", e);
            PANEL_UNAVAILABLE.to_string()
        }
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Panel returning a fixed answer
    #[derive(Clone)]
    pub struct MockPanel {
        pub answer: Arc<Mutex<Option<String>>>,
    }

    impl MockPanel {
        pub fn new(answer: Option<&str>) -> Self {
            Self {
                answer: Arc::new(Mutex::new(answer.map(str::to_string))),
            }
        }
    }

    #[async_trait]
    impl PanelReader for MockPanel {
        async fn read_status(&self) -> Result<String> {
            self.answer
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| CallboxError::Panel("mock panel offline".to_string()))
        }
    }
}
