//! Process-backed SIP user agent
//!
//! Runs the external user agent (baresip) as a child process: commands go in
//! on stdin, registration and call progress are parsed from its stdout, and
//! media activity is read from the ALSA capture status file.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{CallControl, CallSnapshot};
use crate::config::{ServerProfile, ServersConfig, UserAgentConfig};
use crate::error::{CallboxError, Result};
use crate::state::{CallState, Registration, ServerRole};

/// Re-registration interval written to every account line, in seconds
pub const REGISTRATION_INTERVAL_S: u32 = 5;

/// Accounts file line for one server
///
/// ```
/// use callbox::call::user_agent::render_account;
/// use callbox::config::ServerProfile;
///
/// let profile = ServerProfile {
///     address: "10.0.0.5".to_string(),
///     port: Some(5060),
///     user_id: "110".to_string(),
///     password: "secret".to_string(),
///     ..ServerProfile::default()
/// };
/// assert_eq!(
///     render_account(&profile),
///     "<sip:110@10.0.0.5:5060>;auth_pass=secret;answermode=auto;regint=5"
/// );
/// ```
pub fn render_account(profile: &ServerProfile) -> String {
    let mut uri = format!("sip:{}@{}", profile.user_id, profile.address);
    if let Some(port) = profile.port {
        uri.push_str(&format!(":{}", port));
    }
    if profile.tcp_transport {
        uri.push_str(";transport=tcp");
    }
    let answer_mode = if profile.auto_answer { "auto" } else { "manual" };
    format!(
        "<{}>;auth_pass={};answermode={};regint={}",
        uri, profile.password, answer_mode, REGISTRATION_INTERVAL_S
    )
}

/// Rewrite the user agent's accounts file from the configured servers
pub async fn write_accounts(path: impl AsRef<Path>, servers: &ServersConfig) -> Result<()> {
    let mut contents = render_account(&servers.primary);
    contents.push('\n');
    if let Some(secondary) = &servers.secondary {
        contents.push_str(&render_account(secondary));
        contents.push('\n');
    }
    tokio::fs::write(path.as_ref(), contents).await?;
    info!("SIP accounts written to {}", path.as_ref().display());
    Ok(())
}

/// Something the user agent reported on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Registration(ServerRole, bool),
    Call(CallState),
}

/// Address-of-record per account, used to attribute registration lines
#[derive(Debug, Clone, Default)]
pub struct AccountAors {
    pub primary: String,
    pub secondary: Option<String>,
}

impl AccountAors {
    pub fn from_servers(servers: &ServersConfig) -> Self {
        Self {
            primary: servers.primary.aor(),
            secondary: servers.secondary.as_ref().map(ServerProfile::aor),
        }
    }

    fn aor(&self, role: ServerRole) -> Option<&str> {
        match role {
            ServerRole::Primary => Some(&self.primary),
            ServerRole::Secondary => self.secondary.as_deref(),
        }
    }

    fn role_of(&self, line: &str) -> Option<ServerRole> {
        [ServerRole::Secondary, ServerRole::Primary]
            .into_iter()
            .find(|role| self.aor(*role).is_some_and(|aor| mentions_aor(line, aor)))
    }
}

// `aor` appears in `line` and is not just a prefix of a longer host
fn mentions_aor(line: &str, aor: &str) -> bool {
    line.match_indices(aor).any(|(at, _)| {
        match line[at + aor.len()..].chars().next() {
            None => true,
            Some(c) => !(c.is_ascii_alphanumeric() || c == '.' || c == '-'),
        }
    })
}

/// Parse one stdout line of the user agent
pub fn parse_event(line: &str, aors: &AccountAors) -> Option<AgentEvent> {
    let lower = line.to_ascii_lowercase();

    if lower.contains("call established") {
        return Some(AgentEvent::Call(CallState::Active));
    }
    if lower.contains("call terminated") || lower.contains("session closed") {
        return Some(AgentEvent::Call(CallState::Idle));
    }
    if lower.contains("ringing") {
        return Some(AgentEvent::Call(CallState::Ringing));
    }
    if lower.contains("connecting to") || lower.contains("call: dialing") {
        return Some(AgentEvent::Call(CallState::Dialing));
    }

    let role = aors.role_of(line)?;
    if lower.contains("200 ok") {
        return Some(AgentEvent::Registration(role, true));
    }
    if ["failed", "401", "403", "408", "unregistering"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return Some(AgentEvent::Registration(role, false));
    }
    None
}

#[derive(Debug, Default, Clone, Copy)]
struct AgentStatus {
    call_state: CallState,
    registration: Registration,
}

impl AgentStatus {
    fn apply(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Call(state) => self.call_state = state,
            AgentEvent::Registration(ServerRole::Primary, registered) => {
                self.registration.primary = registered
            }
            AgentEvent::Registration(ServerRole::Secondary, registered) => {
                self.registration.secondary = registered
            }
        }
    }
}

struct AgentProcess {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
}

/// `CallControl` over a child user-agent process
pub struct ProcessUserAgent {
    config: UserAgentConfig,
    aors: AccountAors,
    status: Arc<Mutex<AgentStatus>>,
    process: tokio::sync::Mutex<Option<AgentProcess>>,
}

fn lock_status(status: &Mutex<AgentStatus>) -> MutexGuard<'_, AgentStatus> {
    status.lock().unwrap_or_else(|p| p.into_inner())
}

/// Media session state from an ALSA capture status file
pub fn capture_active(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(contents) => !contents.trim().is_empty() && !contents.contains("closed"),
        Err(_) => false,
    }
}

impl ProcessUserAgent {
    pub fn new(config: UserAgentConfig, servers: &ServersConfig) -> Self {
        Self {
            config,
            aors: AccountAors::from_servers(servers),
            status: Arc::new(Mutex::new(AgentStatus::default())),
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Launch the user agent if it is not running
    pub async fn start(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if process.is_none() {
            *process = Some(self.spawn()?);
        }
        Ok(())
    }

    fn spawn(&self) -> Result<AgentProcess> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CallboxError::CallControl("user agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CallboxError::CallControl("user agent stdout unavailable".to_string()))?;

        let status = Arc::clone(&self.status);
        let aors = self.aors.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_event(&line, &aors) {
                            debug!("User agent event: {:?}", event);
                            lock_status(&status).apply(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("User agent output error: {}", e);
                        break;
                    }
                }
            }
            // Nothing is registered once the agent is gone
            *lock_status(&status) = AgentStatus::default();
            debug!("User agent output closed");
        });

        info!("Started user agent {} (pid {:?})", self.config.program, child.id());
        Ok(AgentProcess { child, stdin, reader })
    }

    async fn terminate(process: &mut Option<AgentProcess>) {
        if let Some(mut running) = process.take() {
            if let Err(e) = running.child.kill().await {
                warn!("Not able to kill user agent: {}", e);
            }
            running.reader.abort();
        }
    }

    async fn send(&self, commands: &[String]) -> Result<()> {
        let mut process = self.process.lock().await;
        let running = process
            .as_mut()
            .ok_or_else(|| CallboxError::CallControl("user agent not running".to_string()))?;
        for command in commands {
            running.stdin.write_all(command.as_bytes()).await?;
            running.stdin.write_all(b"\n").await?;
        }
        running.stdin.flush().await?;
        Ok(())
    }

    fn select_account(&self, server: ServerRole) -> Result<String> {
        let aor = self
            .aors
            .aor(server)
            .ok_or_else(|| CallboxError::CallControl(format!("no {} account configured", server)))?;
        Ok(format!("/uafind {}", aor))
    }
}

#[async_trait]
impl CallControl for ProcessUserAgent {
    async fn dial(&self, server: ServerRole, uri: &str) -> Result<()> {
        let commands = [self.select_account(server)?, format!("/dial {}", uri)];
        self.send(&commands).await?;
        lock_status(&self.status).call_state = CallState::Dialing;
        Ok(())
    }

    async fn hangup(&self, server: ServerRole) -> Result<()> {
        let commands = [self.select_account(server)?, "/hangup".to_string()];
        self.send(&commands).await
    }

    async fn restart(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        Self::terminate(&mut process).await;
        *lock_status(&self.status) = AgentStatus::default();
        *process = Some(self.spawn()?);
        info!("User agent restarted");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        Self::terminate(&mut process).await;
        *lock_status(&self.status) = AgentStatus::default();
        Ok(())
    }

    fn snapshot(&self) -> CallSnapshot {
        let status = *lock_status(&self.status);
        CallSnapshot {
            call_state: status.call_state,
            media_active: capture_active(Path::new(&self.config.capture_status)),
            registration: status.registration,
        }
    }
}

impl std::fmt::Debug for ProcessUserAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessUserAgent")
            .field("program", &self.config.program)
            .field("capture_status", &self.config.capture_status)
            .finish()
    }
}
