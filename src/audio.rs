//! # Audio Module
//!
//! Spoken error prompts and playback level, through the ALSA command-line tools.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{CallboxError, Result};

/// Base mixer level; each speaker volume step adds [`VOLUME_STEP`]
pub const PLAYBACK_BASE_LEVEL: u32 = 205;

/// Mixer units per configured speaker volume step
pub const VOLUME_STEP: u32 = 5;

/// Mixer level for a configured speaker volume
pub fn playback_level(speaker_volume: u8) -> u32 {
    PLAYBACK_BASE_LEVEL + VOLUME_STEP * speaker_volume as u32
}

/// Audio output used for user feedback
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Play `clip` `times` times in a row
    async fn play(&self, clip: &Path, times: u32) -> Result<()>;

    /// Set the playback mixer level
    async fn set_playback_volume(&self, level: u32) -> Result<()>;
}

/// `aplay` / `amixer` backed player
#[derive(Debug, Clone, Default)]
pub struct AlsaAudio;

impl AlsaAudio {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioPlayer for AlsaAudio {
    async fn play(&self, clip: &Path, times: u32) -> Result<()> {
        for attempt in 0..times {
            let status = Command::new("aplay").arg(clip).status().await?;
            if !status.success() {
                warn!("aplay {} failed on play {} ({})", clip.display(), attempt + 1, status);
                return Err(CallboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("aplay exited with {}", status),
                )));
            }
        }
        debug!("Played {} x{}", clip.display(), times);
        Ok(())
    }

    async fn set_playback_volume(&self, level: u32) -> Result<()> {
        let status = Command::new("amixer")
            .args(["set", "Playback", &level.to_string()])
            .status()
            .await?;
        if !status.success() {
            return Err(CallboxError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("amixer exited with {}", status),
            )));
        }
        debug!("Playback level set to {}", level);
        Ok(())
    }
}
