//! Local command socket
//!
//! One command per line; every command gets a one-line `OK ...` or `ERR ...`
//! reply. `KILL` requests a full shutdown and closes the connection.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::call::{DialOutcome, Dialer};
use crate::error::Result;
use crate::telemetry::{ReportOutcome, TelemetryPipeline};

/// Commands accepted on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Dial the default number
    Call,
    /// Assemble and send a telemetry sample now
    Data,
    /// Shut the application down
    Kill,
}

impl Command {
    /// Parse the first word of `line`, case-insensitive
    ///
    /// # Examples
    ///
    /// ```
    /// use callbox::control::Command;
    ///
    /// assert_eq!(Command::parse("call\r\n"), Some(Command::Call));
    /// assert_eq!(Command::parse("REBOOT"), None);
    /// ```
    pub fn parse(line: &str) -> Option<Self> {
        let word = line.split_whitespace().next()?;
        match word.to_ascii_uppercase().as_str() {
            "CALL" => Some(Self::Call),
            "DATA" => Some(Self::Data),
            "KILL" => Some(Self::Kill),
            _ => None,
        }
    }
}

/// Executes commands against the running application
pub struct CommandHandler {
    dialer: Arc<Dialer>,
    pipeline: TelemetryPipeline,
    kill: CancellationToken,
    connections: TaskTracker,
}

impl CommandHandler {
    /// `kill` is cancelled when a `KILL` command arrives
    pub fn new(dialer: Arc<Dialer>, pipeline: TelemetryPipeline, kill: CancellationToken) -> Self {
        Self {
            dialer,
            pipeline,
            kill,
            connections: TaskTracker::new(),
        }
    }

    /// Run one command and return the reply line (without newline)
    pub async fn execute(&self, command: Command) -> String {
        match command {
            Command::Call => match self.dialer.dial_default().await {
                DialOutcome::Dialed(role) => format!("OK dialed {}", role),
                DialOutcome::Busy => "ERR busy".to_string(),
                DialOutcome::NoLink => "ERR no link".to_string(),
                DialOutcome::NoServer => "ERR no server".to_string(),
                DialOutcome::Failed => "ERR dial failed".to_string(),
            },
            Command::Data => match self.pipeline.report().await {
                ReportOutcome::Delivered => "OK delivered".to_string(),
                ReportOutcome::Queued => "OK queued".to_string(),
                ReportOutcome::Lost => "ERR lost".to_string(),
            },
            Command::Kill => {
                info!("KILL received, requesting shutdown");
                self.kill.cancel();
                "OK".to_string()
            }
        }
    }

    /// Serve one client until it disconnects or sends `KILL`
    pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let command = Command::parse(&line);
            let reply = match command {
                Some(command) => self.execute(command).await,
                None => {
                    debug!("Unknown command: {:.40}", line);
                    "ERR unknown command".to_string()
                }
            };
            writer.write_all(reply.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;

            if command == Some(Command::Kill) {
                break;
            }
        }
        Ok(())
    }

    /// Accept clients until `cancel` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("Command socket listening on {}", addr),
            Err(e) => warn!("Command socket address unknown: {}", e),
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Command socket accept failed: {}", e);
                        continue;
                    }
                },
            };

            debug!("Command client connected from {}", peer);
            let handler = Arc::clone(&self);
            let cancel = cancel.clone();
            self.connections.spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => debug!("Command client {} dropped on shutdown", peer),
                    result = handler.handle_connection(stream) => {
                        if let Err(e) = result {
                            warn!("Command client {} failed: {}", peer, e);
                        }
                    }
                }
            });
        }
        debug!("Command socket closed");
    }

    /// Wait until every client task has ended
    ///
    /// Call after cancelling `serve`; commands still in flight are abandoned
    /// at their next await point and never touch state afterwards.
    pub async fn close_connections(&self) {
        self.connections.close();
        self.connections.wait().await;
    }
}
