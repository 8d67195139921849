//! # Status Snapshot File
//!
//! Key/value status lines read by the device web UI. Rewritten only when the
//! published view changes.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::Result;
use crate::state::StatusView;

/// Render the status lines in the order the web UI expects
pub fn render(view: &StatusView) -> String {
    format!(
        "prmySipregStatus-{}\nnetworkStatus-{}\nprmyLogserverStatus-{}\nscndSipregStatus-{}\nscndLogserverStatus-0\n",
        view.primary_registered as u8,
        view.link_up as u8,
        view.primary_active as u8,
        view.secondary_registered as u8,
    )
}

/// Status file writer shared by the monitors
#[derive(Debug)]
pub struct StatusFile {
    path: PathBuf,
    last: Mutex<Option<StatusView>>,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: Mutex::new(None),
        }
    }

    /// Write `view` unless it matches the last successful write
    ///
    /// Returns `true` when the file was rewritten. A failed write leaves the
    /// last view untouched so the next call retries.
    pub async fn publish(&self, view: StatusView) -> bool {
        if self.last_view() == Some(view) {
            return false;
        }

        match self.write(&view).await {
            Ok(()) => {
                *self.last.lock().unwrap_or_else(|p| p.into_inner()) = Some(view);
                debug!("Status file updated: {:?}", view);
                true
            }
            Err(e) => {
                warn!("Not able to write status file {}: {}", self.path.display(), e);
                false
            }
        }
    }

    fn last_view(&self) -> Option<StatusView> {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn write(&self, view: &StatusView) -> Result<()> {
        tokio::fs::write(&self.path, render(view)).await?;
        Ok(())
    }
}
