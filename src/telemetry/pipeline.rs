//! Store-and-forward telemetry pipeline
//!
//! `report` assembles one sample and sends it to the active server when the
//! network monitor says a server is reachable; anything that cannot be sent
//! goes to the [`LocalQueue`]. The drain replays the queue oldest first after
//! reachability returns, and at most one drain runs at a time.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ServerProfile, ServersConfig};
use crate::error::Result;
use crate::network::monitor::DrainTrigger;
use crate::panel::{status_or_unavailable, PanelReader};
use crate::scheduler::Wake;
use crate::state::{PinId, ServerRole, SharedState};
use crate::telemetry::queue::LocalQueue;
use crate::telemetry::sample::{is_valid_body, TelemetrySample};
use crate::telemetry::transport::TelemetryTransport;

/// What happened to one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Delivered,
    /// Kept in the local queue for a later drain
    Queued,
    /// Could not be sent nor stored
    Lost,
}

/// Result of one drain pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub delivered: usize,
    /// Malformed entries dropped from the queue
    pub skipped: usize,
    pub remaining: usize,
}

/// Static inputs of the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mac: String,
    pub din_pins: Vec<PinId>,
    pub last_log: Option<PathBuf>,
}

struct Inner {
    state: SharedState,
    transport: Arc<dyn TelemetryTransport>,
    panel: Option<Arc<dyn PanelReader>>,
    queue: tokio::sync::Mutex<LocalQueue>,
    servers: ServersConfig,
    settings: PipelineSettings,
    local_pending: AtomicBool,
    draining: AtomicBool,
    drain_task: Mutex<Option<JoinHandle<DrainReport>>>,
}

/// Cloneable handle; clones share the queue and the drain guard
#[derive(Clone)]
pub struct TelemetryPipeline {
    inner: Arc<Inner>,
}

impl TelemetryPipeline {
    pub fn new(
        state: SharedState,
        transport: Arc<dyn TelemetryTransport>,
        panel: Option<Arc<dyn PanelReader>>,
        queue: LocalQueue,
        servers: ServersConfig,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                transport,
                panel,
                queue: tokio::sync::Mutex::new(queue),
                servers,
                settings,
                local_pending: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                drain_task: Mutex::new(None),
            }),
        }
    }

    /// Pick up entries left from a previous run; returns how many were found
    pub async fn recover(&self) -> Result<usize> {
        let queue = self.inner.queue.lock().await;
        let count = queue.len().await?;
        if count > 0 {
            self.inner.local_pending.store(true, Ordering::SeqCst);
            info!("Found {} undelivered telemetry entries in {}", count, queue.path().display());
        }
        Ok(count)
    }

    /// Locally queued data is waiting for a drain
    pub fn local_pending(&self) -> bool {
        self.inner.local_pending.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Block on `wake` and report once per wake until it is closed
    pub async fn run(self, wake: Wake) {
        info!("Telemetry pipeline started");
        while wake.wait().await {
            let outcome = self.report().await;
            debug!("Telemetry report: {:?}", outcome);
        }
        debug!("Telemetry pipeline stopped");
    }

    /// Assemble one sample and deliver or queue it
    pub async fn report(&self) -> ReportOutcome {
        let inner = &self.inner;

        let psu = status_or_unavailable(inner.panel.as_deref()).await;
        let snapshot = inner.state.update(|s| {
            s.panel_status = psu.clone();
            s.clone()
        });

        let sample = TelemetrySample::assemble(
            &inner.settings.mac,
            &snapshot,
            &inner.settings.din_pins,
            &psu,
            Local::now().naive_local(),
        );
        let body = match sample.to_body() {
            Ok(body) => body,
            Err(e) => {
                error!("Not able to encode telemetry sample: {}", e);
                return ReportOutcome::Lost;
            }
        };

        if snapshot.link_up && snapshot.server_reachable {
            let target = self.target(snapshot.active_server);
            match inner.transport.deliver(target, &body).await {
                Ok(()) => {
                    self.record_last_good(&body).await;
                    inner.state.update(|s| s.pending_telemetry = false);
                    return ReportOutcome::Delivered;
                }
                Err(e) => warn!("Telemetry delivery to {} failed: {}", target.telemetry_host(), e),
            }
        } else {
            debug!("No server reachable, queueing telemetry");
        }

        let queue = inner.queue.lock().await;
        match queue.append(&body).await {
            Ok(()) => {
                inner.local_pending.store(true, Ordering::SeqCst);
                ReportOutcome::Queued
            }
            Err(e) => {
                error!("Not able to store telemetry in {}: {}", queue.path().display(), e);
                ReportOutcome::Lost
            }
        }
    }

    fn target(&self, role: ServerRole) -> &ServerProfile {
        self.inner
            .servers
            .profile(role)
            .unwrap_or(&self.inner.servers.primary)
    }

    async fn record_last_good(&self, body: &str) {
        if let Some(path) = &self.inner.settings.last_log {
            if let Err(e) = tokio::fs::write(path, body).await {
                warn!("Not able to write last log {}: {}", path.display(), e);
            }
        }
    }

    /// Replay the queue oldest first, stopping at the first failed delivery
    ///
    /// Removes exactly the processed prefix (delivered and malformed entries);
    /// entries appended while the drain runs stay queued.
    pub async fn drain(&self) -> Result<DrainReport> {
        let inner = &self.inner;
        let entries = inner.queue.lock().await.entries().await?;
        let role = inner.state.read(|s| s.active_server);
        let target = self.target(role);

        let mut report = DrainReport::default();
        let mut processed = 0;
        for entry in &entries {
            if !is_valid_body(&entry.body) {
                warn!("Skipping malformed queued entry {}: {:.60}", entry.seq, entry.body);
                report.skipped += 1;
                processed += 1;
                continue;
            }
            match inner.transport.deliver(target, &entry.body).await {
                Ok(()) => {
                    report.delivered += 1;
                    processed += 1;
                }
                Err(e) => {
                    info!("Drain stopped at entry {}: {}", entry.seq, e);
                    break;
                }
            }
        }

        let queue = inner.queue.lock().await;
        queue.remove_front(processed).await?;
        report.remaining = queue.len().await?;
        if report.remaining == 0 {
            inner.local_pending.store(false, Ordering::SeqCst);
        }
        drop(queue);

        info!(
            "Drain finished: {} delivered, {} skipped, {} left",
            report.delivered, report.skipped, report.remaining
        );
        Ok(report)
    }

    /// Wait for a running drain to finish
    pub async fn join_drain(&self) -> Option<DrainReport> {
        let task = lock_task(&self.inner.drain_task).take()?;
        match task.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Drain task ended abnormally: {}", e);
                None
            }
        }
    }
}

fn lock_task(slot: &Mutex<Option<JoinHandle<DrainReport>>>) -> MutexGuard<'_, Option<JoinHandle<DrainReport>>> {
    slot.lock().unwrap_or_else(|p| p.into_inner())
}

impl DrainTrigger for TelemetryPipeline {
    /// Spawn a drain if data is pending and none is running
    fn start_drain(&self) -> bool {
        if !self.local_pending() {
            return false;
        }
        if self.inner.draining.swap(true, Ordering::SeqCst) {
            debug!("Drain already running");
            return false;
        }

        let pipeline = self.clone();
        let task = tokio::spawn(async move {
            let report = match pipeline.drain().await {
                Ok(report) => report,
                Err(e) => {
                    warn!("Drain failed: {}", e);
                    DrainReport::default()
                }
            };
            pipeline.inner.draining.store(false, Ordering::SeqCst);
            report
        });
        *lock_task(&self.inner.drain_task) = Some(task);
        info!("Drain started");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::mocks::MockPanel;
    use crate::panel::PANEL_UNAVAILABLE;
    use crate::state::DeviceState;
    use crate::telemetry::transport::mocks::MockTransport;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        state: SharedState,
        transport: MockTransport,
        panel: MockPanel,
        queue: LocalQueue,
        last_log: PathBuf,
        pipeline: TelemetryPipeline,
    }

    fn servers() -> ServersConfig {
        ServersConfig {
            primary: ServerProfile {
                address: "10.0.0.5".to_string(),
                ..ServerProfile::default()
            },
            secondary: Some(ServerProfile {
                address: "10.0.0.6".to_string(),
                ..ServerProfile::default()
            }),
        }
    }

    fn online() -> DeviceState {
        DeviceState {
            link_up: true,
            server_reachable: true,
            ..DeviceState::default()
        }
    }

    fn fixture(initial: DeviceState) -> Fixture {
        let dir = TempDir::new().unwrap();
        let queue = LocalQueue::new(dir.path().join("locallog.log"));
        let last_log = dir.path().join("lastlog");
        let state = SharedState::new(initial);
        let transport = MockTransport::new();
        let panel = MockPanel::new(Some("psu:1"));
        let pipeline = TelemetryPipeline::new(
            state.clone(),
            Arc::new(transport.clone()),
            Some(Arc::new(panel.clone())),
            queue.clone(),
            servers(),
            PipelineSettings {
                mac: "00:1a:2b:3c:4d:5e".to_string(),
                din_pins: vec![129, 136, 133, 132],
                last_log: Some(last_log.clone()),
            },
        );
        Fixture { _dir: dir, state, transport, panel, queue, last_log, pipeline }
    }

    fn set_panel(panel: &MockPanel, answer: &str) {
        *panel.answer.lock().unwrap() = Some(answer.to_string());
    }

    async fn queued_bodies(queue: &LocalQueue) -> Vec<String> {
        queue.entries().await.unwrap().into_iter().map(|e| e.body).collect()
    }

    #[tokio::test]
    async fn test_report_delivers_to_active_server() {
        let f = fixture(DeviceState {
            active_server: ServerRole::Secondary,
            pending_telemetry: true,
            ..online()
        });

        assert_eq!(f.pipeline.report().await, ReportOutcome::Delivered);

        assert_eq!(f.transport.hosts(), vec!["10.0.0.6".to_string()]);
        let body = &f.transport.bodies()[0];
        assert!(body.contains("\"psu\":\"psu:1\""));
        assert_eq!(&std::fs::read_to_string(&f.last_log).unwrap(), body);
        assert!(!f.state.read(|s| s.pending_telemetry));
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_report_queues_when_unreachable() {
        let f = fixture(DeviceState {
            pending_telemetry: true,
            ..DeviceState::default()
        });

        assert_eq!(f.pipeline.report().await, ReportOutcome::Queued);

        assert!(f.transport.bodies().is_empty());
        assert_eq!(f.queue.len().await.unwrap(), 1);
        assert!(f.pipeline.local_pending());
        assert!(f.state.read(|s| s.pending_telemetry));
    }

    #[tokio::test]
    async fn test_failed_delivery_is_queued_not_delivered() {
        let f = fixture(online());
        f.transport.set_offline(true);

        assert_eq!(f.pipeline.report().await, ReportOutcome::Queued);
        assert!(f.transport.bodies().is_empty());
        assert_eq!(f.queue.len().await.unwrap(), 1);
        assert!(!f.last_log.exists());
    }

    #[tokio::test]
    async fn test_panel_failure_reports_unavailable() {
        let f = fixture(online());
        *f.panel.answer.lock().unwrap() = None;

        f.pipeline.report().await;

        assert!(f.transport.bodies()[0].contains(&format!("\"psu\":\"{}\"", PANEL_UNAVAILABLE)));
        assert_eq!(f.state.read(|s| s.panel_status.clone()), PANEL_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_failed_samples_delivered_exactly_once_after_drain() {
        let f = fixture(online());
        let mut failed = Vec::new();

        // Ten reports, every third one while the server is down
        for i in 0..10 {
            set_panel(&f.panel, &format!("psu:{}", i));
            let down = i % 3 == 0;
            f.transport.set_offline(down);
            let outcome = f.pipeline.report().await;
            if down {
                assert_eq!(outcome, ReportOutcome::Queued);
                failed.push(format!("\"psu\":\"psu:{}\"", i));
            } else {
                assert_eq!(outcome, ReportOutcome::Delivered);
            }
        }
        let delivered_before = f.transport.bodies().len();

        f.transport.set_offline(false);
        let report = f.pipeline.drain().await.unwrap();

        assert_eq!(report, DrainReport { delivered: failed.len(), skipped: 0, remaining: 0 });
        let replayed = &f.transport.bodies()[delivered_before..];
        assert_eq!(replayed.len(), failed.len());
        for (body, marker) in replayed.iter().zip(&failed) {
            assert!(body.contains(marker), "{} should contain {}", body, marker);
        }
        let unique: HashSet<_> = f.transport.bodies().into_iter().collect();
        assert_eq!(unique.len(), 10);
        assert!(!f.queue.path().exists());
        assert!(!f.pipeline.local_pending());
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let f = fixture(DeviceState::default());
        for i in 0..5 {
            set_panel(&f.panel, &format!("psu:{}", i));
            f.pipeline.report().await;
        }
        let queued = queued_bodies(&f.queue).await;
        assert_eq!(queued.len(), 5);

        f.transport.push_outcomes(&[true, true, false]);
        let report = f.pipeline.drain().await.unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.remaining, 3);
        assert_eq!(f.transport.bodies(), queued[..2].to_vec());
        assert_eq!(queued_bodies(&f.queue).await, queued[2..].to_vec());
        assert!(f.pipeline.local_pending());
    }

    #[tokio::test]
    async fn test_drain_skips_malformed_entries() {
        let f = fixture(DeviceState::default());
        f.pipeline.report().await;
        f.queue.append("{not json").await.unwrap();
        f.pipeline.report().await;

        let report = f.pipeline.drain().await.unwrap();

        assert_eq!(report, DrainReport { delivered: 2, skipped: 1, remaining: 0 });
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_start_drain_is_guarded() {
        let f = fixture(DeviceState::default());
        assert!(!f.pipeline.start_drain(), "nothing pending");

        f.pipeline.report().await;
        assert!(f.pipeline.start_drain());
        assert!(!f.pipeline.start_drain(), "second drain must be refused");

        let report = f.pipeline.join_drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(!f.pipeline.is_draining());
        assert!(!f.pipeline.local_pending());
    }

    #[tokio::test]
    async fn test_recover_existing_queue() {
        let f = fixture(DeviceState::default());
        f.queue.append("{\"macid\":\"x\"}").await.unwrap();
        assert!(!f.pipeline.local_pending());

        assert_eq!(f.pipeline.recover().await.unwrap(), 1);
        assert!(f.pipeline.local_pending());
    }

    #[tokio::test]
    async fn test_run_reports_on_wake() {
        let f = fixture(online());
        let wake = Wake::new();
        let worker = tokio::spawn(f.pipeline.clone().run(wake.clone()));

        wake.wake();
        for _ in 0..50 {
            if !f.transport.bodies().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        wake.close();
        worker.await.unwrap();

        assert_eq!(f.transport.bodies().len(), 1);
    }
}
