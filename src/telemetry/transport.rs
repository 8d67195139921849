//! HTTP/1.0 over a plain TCP connection
//!
//! The log server only needs a bare request: one write, read the reply until
//! the peer closes, look at the status line.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ServerProfile;
use crate::error::{CallboxError, Result};

/// Largest response kept; the rest is discarded
pub const MAX_RESPONSE_LEN: usize = 4096;

/// Delivery of one telemetry body to a server
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn deliver(&self, server: &ServerProfile, body: &str) -> Result<()>;
}

/// Build the telemetry POST request
pub fn build_post(path: &str, secret: &str, body: &str) -> BytesMut {
    let mut request = BytesMut::with_capacity(128 + path.len() + body.len());
    request.put_slice(format!("POST {} HTTP/1.0\r\n", path).as_bytes());
    request.put_slice(format!("seckey:{}\r\n", secret).as_bytes());
    request.put_slice(b"content-Type:application/json\r\n");
    request.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    request.put_slice(b"\r\n");
    request.put_slice(body.as_bytes());
    request
}

/// Build a body-less GET request
pub fn build_get(path: &str) -> BytesMut {
    let mut request = BytesMut::with_capacity(32 + path.len());
    request.put_slice(format!("GET {} HTTP/1.0\r\n\r\n", path).as_bytes());
    request
}

/// Status code from the first response line, if it is an HTTP status line
pub fn status_code(response: &[u8]) -> Option<u16> {
    let line_end = response
        .iter()
        .position(|b| *b == b'\n')
        .unwrap_or(response.len());
    let line = std::str::from_utf8(&response[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Body of a raw HTTP response (after the blank line)
pub fn response_body(response: &[u8]) -> &[u8] {
    response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| &response[at + 4..])
        .or_else(|| {
            response
                .windows(2)
                .position(|w| w == b"\n\n")
                .map(|at| &response[at + 2..])
        })
        .unwrap_or(&[])
}

/// Request/response over TCP with a bounded total duration
#[derive(Debug, Clone)]
pub struct HttpTransport {
    limit: Duration,
}

impl HttpTransport {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    async fn exchange(&self, host: &str, port: u16, request: &[u8]) -> Result<Vec<u8>> {
        let attempt = async {
            let mut stream = TcpStream::connect((host, port)).await?;
            stream.write_all(request).await?;
            stream.flush().await?;

            let mut response = Vec::with_capacity(512);
            let mut chunk = [0u8; 1024];
            while response.len() < MAX_RESPONSE_LEN {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                let room = MAX_RESPONSE_LEN - response.len();
                response.extend_from_slice(&chunk[..n.min(room)]);
            }
            Ok::<_, CallboxError>(response)
        };

        timeout(self.limit, attempt)
            .await
            .map_err(|_| CallboxError::Timeout(format!("{}:{} after {:?}", host, port, self.limit)))?
    }

    /// GET the server-time resource; returns the response body
    pub async fn fetch_server_time(&self, server: &ServerProfile) -> Result<String> {
        let request = build_get(&server.time_sync_path);
        let response = self
            .exchange(server.telemetry_host(), server.telemetry_port, &request)
            .await?;
        match status_code(&response) {
            Some(200) => Ok(String::from_utf8_lossy(response_body(&response)).into_owned()),
            other => Err(CallboxError::Transport(format!(
                "time request answered with {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl TelemetryTransport for HttpTransport {
    async fn deliver(&self, server: &ServerProfile, body: &str) -> Result<()> {
        let request = build_post(&server.telemetry_path, &server.secret, body);
        let host = server.telemetry_host();
        let response = self.exchange(host, server.telemetry_port, &request).await?;

        match status_code(&response) {
            Some(200) => {
                debug!("Telemetry accepted by {}", host);
                Ok(())
            }
            Some(code) => Err(CallboxError::Transport(format!("{} answered {}", host, code))),
            None if response.is_empty() => {
                Err(CallboxError::Transport(format!("{} closed without a response", host)))
            }
            None => Err(CallboxError::Transport(format!("{} sent a malformed response", host))),
        }
    }
}
