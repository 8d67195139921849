//! # Call Module
//!
//! Boundary to the external SIP user agent plus the outbound dial path.
//!
//! This module handles:
//! - The [`CallControl`] seam (dial, hangup, restart, status snapshot)
//! - [`Dialer`]: the single place a dial is issued, from PTT or the command socket
//! - The call-state watchdog ([`watchdog`])
//! - A process-backed user agent ([`user_agent`])

pub mod user_agent;
pub mod watchdog;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::audio::AudioPlayer;
use crate::config::ServersConfig;
use crate::error::Result;
use crate::state::{CallState, Registration, ServerRole, SharedState};

/// What the call subsystem currently reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub call_state: CallState,
    /// A media session is open (audio is flowing)
    pub media_active: bool,
    pub registration: Registration,
}

/// External SIP user agent
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Place an outbound call to `uri` through `server`'s account
    async fn dial(&self, server: ServerRole, uri: &str) -> Result<()>;

    /// Tear down any call bound to `server`'s account
    async fn hangup(&self, server: ServerRole) -> Result<()>;

    /// Terminate and relaunch the call subsystem
    async fn restart(&self) -> Result<()>;

    /// Stop the call subsystem for good
    async fn stop(&self) -> Result<()>;

    fn snapshot(&self) -> CallSnapshot;
}

/// Result of a dial request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    /// Dial issued through this server
    Dialed(ServerRole),
    /// The call subsystem refused the dial command
    Failed,
    /// A call is already being set up or is connected
    Busy,
    /// No link: the cable prompt was played
    NoLink,
    /// Link up but no reachable, registered server: the server prompt was played
    NoServer,
}

/// Audio clips played when a dial cannot be placed
#[derive(Debug, Clone)]
pub struct ErrorPrompts {
    pub connection: PathBuf,
    pub server: PathBuf,
    pub repeat: u32,
}

/// Issues dials to the default number through the active server
pub struct Dialer {
    state: SharedState,
    call: Arc<dyn CallControl>,
    audio: Arc<dyn AudioPlayer>,
    servers: ServersConfig,
    number: String,
    prompts: ErrorPrompts,
}

impl Dialer {
    pub fn new(
        state: SharedState,
        call: Arc<dyn CallControl>,
        audio: Arc<dyn AudioPlayer>,
        servers: ServersConfig,
        number: String,
        prompts: ErrorPrompts,
    ) -> Self {
        Self {
            state,
            call,
            audio,
            servers,
            number,
            prompts,
        }
    }

    /// Dial the configured default number
    ///
    /// Every issued dial bumps `dial_attempts`, which arms the watchdog,
    /// including a dial the user agent rejected: a dead agent is exactly what
    /// the watchdog's restart is for.
    pub async fn dial_default(&self) -> DialOutcome {
        let (call_state, link_up, reachable, registration, active) = self.state.read(|s| {
            (
                s.call_state,
                s.link_up,
                s.server_reachable,
                s.registration,
                s.active_server,
            )
        });

        if call_state.in_progress() {
            info!("Dial ignored, call already {:?}", call_state);
            return DialOutcome::Busy;
        }

        if !link_up {
            warn!("Dial requested with network cable disconnected");
            self.prompt(self.prompts.connection.clone());
            return DialOutcome::NoLink;
        }

        if !reachable || !registration.any() {
            warn!(
                "Dial requested with no usable server (reachable: {}, registration: {:?})",
                reachable, registration
            );
            self.prompt(self.prompts.server.clone());
            return DialOutcome::NoServer;
        }

        let (role, profile) = match self.servers.profile(active) {
            Some(profile) => (active, profile),
            None => (ServerRole::Primary, &self.servers.primary),
        };
        let uri = profile.dial_uri(&self.number);

        let result = self.call.dial(role, &uri).await;
        self.state.update(|s| s.dial_attempts += 1);

        match result {
            Ok(()) => {
                info!("Calling {} via {} server", uri, role);
                DialOutcome::Dialed(role)
            }
            Err(e) => {
                warn!("Dial to {} failed: {}", uri, e);
                DialOutcome::Failed
            }
        }
    }

    // Detached so the caller's loop keeps ticking while the prompt plays.
    fn prompt(&self, clip: PathBuf) {
        let audio = Arc::clone(&self.audio);
        let repeat = self.prompts.repeat;
        tokio::spawn(async move {
            if let Err(e) = audio.play(&clip, repeat).await {
                warn!("Error prompt {} failed: {}", clip.display(), e);
            }
        });
    }
}
