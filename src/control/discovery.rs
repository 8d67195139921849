//! UDP discovery responder
//!
//! Site tools broadcast `SENDID:<their-ip>`; the device connects back over TCP
//! to the reply port and sends `<description>-<own-ip>`.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::error::{CallboxError, Result};

const MAX_DATAGRAM: usize = 512;

/// Requester address from a `SENDID:<ip>` datagram
///
/// ```
/// use callbox::control::discovery::parse_request;
///
/// assert_eq!(parse_request("SENDID:192.168.1.20").unwrap().to_string(), "192.168.1.20");
/// assert!(parse_request("HELLO:192.168.1.20").is_none());
/// ```
pub fn parse_request(message: &str) -> Option<IpAddr> {
    let (verb, address) = message.trim().split_once(':')?;
    if verb != "SENDID" {
        return None;
    }
    address.trim().trim_end_matches('\0').parse().ok()
}

pub struct DiscoveryResponder {
    description: String,
    /// Configured address; empty means use the reply connection's local address
    ip_addr: String,
    reply_port: u16,
    limit: Duration,
}

impl DiscoveryResponder {
    pub fn new(device: &DeviceConfig, reply_port: u16, limit: Duration) -> Self {
        Self {
            description: device.description.clone(),
            ip_addr: device.ip_addr.clone(),
            reply_port,
            limit,
        }
    }

    /// Connect back to `requester` and send the identity string
    pub async fn reply(&self, requester: IpAddr) -> Result<String> {
        let attempt = async {
            let mut stream = TcpStream::connect((requester, self.reply_port)).await?;
            let own_ip = if self.ip_addr.is_empty() {
                stream.local_addr()?.ip().to_string()
            } else {
                self.ip_addr.clone()
            };
            let identity = format!("{}-{}", self.description, own_ip);
            stream.write_all(identity.as_bytes()).await?;
            stream.shutdown().await?;
            Ok::<_, CallboxError>(identity)
        };

        timeout(self.limit, attempt).await.map_err(|_| {
            CallboxError::Timeout(format!("discovery reply to {}:{}", requester, self.reply_port))
        })?
    }

    /// Answer discovery datagrams until `cancel` fires
    pub async fn serve(self, socket: UdpSocket, cancel: CancellationToken) {
        match socket.local_addr() {
            Ok(addr) => info!("Discovery listening on {}", addr),
            Err(e) => warn!("Discovery socket address unknown: {}", e),
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Discovery receive failed: {}", e);
                        continue;
                    }
                },
            };

            let message = String::from_utf8_lossy(&buf[..len]);
            let Some(requester) = parse_request(&message) else {
                debug!("Ignoring datagram from {}: {:.40}", from, message);
                continue;
            };

            match self.reply(requester).await {
                Ok(identity) => info!("Sent identity '{}' to {}", identity, requester),
                Err(e) => warn!("Discovery reply to {} failed: {}", requester, e),
            }
        }
        debug!("Discovery stopped");
    }
}
