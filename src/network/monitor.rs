//! Network and server availability monitor
//!
//! Owns `link_up`, `server_reachable` and `active_server`. Each tick probes the
//! link, then the primary server, then (only if the primary is down) the
//! secondary, and fails the active account over accordingly. A switch is held
//! back while a call is connected.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::call::CallControl;
use crate::config::ServersConfig;
use crate::gpio::{drive_output, GpioPort};
use crate::network::{LinkStatusProbe, ReachabilityProbe};
use crate::scheduler::Wake;
use crate::state::{CallState, Level, PinId, Registration, ServerRole, SharedState};
use crate::status::StatusFile;

/// Hook run when servers become reachable again
///
/// The monitor fires it only on the unreachable-to-reachable edge. A sample
/// queued after a failed delivery while the ping probe kept succeeding waits
/// for the next such edge (or a restart) before it is replayed.
pub trait DrainTrigger: Send + Sync {
    /// Start replaying locally queued data; `true` if a drain was started
    fn start_drain(&self) -> bool;
}

/// Outcome of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkReport {
    pub link_up: bool,
    pub server_reachable: bool,
    pub switched_to: Option<ServerRole>,
    /// A switch was wanted but a call is connected
    pub switch_deferred: bool,
    pub drain_started: bool,
}

pub struct NetworkMonitor {
    state: SharedState,
    link: Arc<dyn LinkStatusProbe>,
    reachability: Arc<dyn ReachabilityProbe>,
    call: Arc<dyn CallControl>,
    gpio: Arc<dyn GpioPort>,
    servers: ServersConfig,
    network_led: PinId,
    probe_timeout: Duration,
    status: Option<Arc<StatusFile>>,
    drain: Option<Arc<dyn DrainTrigger>>,
}

impl NetworkMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SharedState,
        link: Arc<dyn LinkStatusProbe>,
        reachability: Arc<dyn ReachabilityProbe>,
        call: Arc<dyn CallControl>,
        gpio: Arc<dyn GpioPort>,
        servers: ServersConfig,
        network_led: PinId,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            state,
            link,
            reachability,
            call,
            gpio,
            servers,
            network_led,
            probe_timeout,
            status: None,
            drain: None,
        }
    }

    pub fn with_status(mut self, status: Arc<StatusFile>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_drain(mut self, drain: Arc<dyn DrainTrigger>) -> Self {
        self.drain = Some(drain);
        self
    }

    /// Block on `wake` and tick until it is closed
    pub async fn run(mut self, wake: Wake) {
        info!(
            "Network monitor started (primary {}, secondary {})",
            self.servers.primary.address,
            self.servers
                .secondary
                .as_ref()
                .map(|s| s.address.as_str())
                .unwrap_or("none")
        );
        while wake.wait().await {
            self.tick().await;
        }
        debug!("Network monitor stopped");
    }

    /// One polling pass
    pub async fn tick(&mut self) -> NetworkReport {
        let mut report = NetworkReport::default();

        // 1. Link carrier
        let link_up = self.link.link_up();
        let (was_link_up, was_reachable, active) = self.state.update(|s| {
            let before = (s.link_up, s.server_reachable, s.active_server);
            s.link_up = link_up;
            if !link_up {
                s.registration = Registration::default();
            }
            before
        });
        report.link_up = link_up;

        if was_link_up && !link_up {
            warn!("Network link lost, registrations cleared");
            if let Err(e) = self.call.hangup(active).await {
                debug!("Hangup on link loss failed: {}", e);
            }
        } else if !was_link_up && link_up {
            info!("Network link up");
        }

        // 2./3. Primary first, secondary only as a fallback
        let primary_ok = self
            .reachability
            .reachable(&self.servers.primary.address, self.probe_timeout)
            .await;
        let secondary_ok = match (&self.servers.secondary, primary_ok) {
            (Some(secondary), false) => {
                self.reachability
                    .reachable(&secondary.address, self.probe_timeout)
                    .await
            }
            _ => false,
        };

        let target = if primary_ok {
            Some(ServerRole::Primary)
        } else if secondary_ok {
            Some(ServerRole::Secondary)
        } else {
            None
        };

        if let Some(target) = target {
            let (active, call_state) = self.state.read(|s| (s.active_server, s.call_state));
            if target != active {
                if call_state == CallState::Active {
                    debug!("Switch to {} server deferred until the call ends", target);
                    report.switch_deferred = true;
                } else if self.switch(active, target).await {
                    report.switched_to = Some(target);
                } else {
                    report.switch_deferred = true;
                }
            }
        }

        // 4. Aggregate reachability
        let reachable = primary_ok || secondary_ok;
        self.state.update(|s| s.server_reachable = reachable);
        report.server_reachable = reachable;
        if was_reachable != reachable {
            if reachable {
                info!("Server reachable");
            } else {
                warn!("No server reachable");
            }
        }

        // 5. Network LED
        drive_output(self.gpio.as_ref(), &self.state, self.network_led, Level::from(link_up));

        if let Some(status) = &self.status {
            let view = self.state.read(|s| s.status_view());
            status.publish(view).await;
        }

        // 6. Replay queued data on the reachability edge
        if !was_reachable && reachable {
            if let Some(drain) = &self.drain {
                report.drain_started = drain.start_drain();
            }
        }

        report
    }

    /// Hang up on `from` and make `to` active; `false` if a call became
    /// Active while hanging up, in which case `from` stays active
    async fn switch(&self, from: ServerRole, to: ServerRole) -> bool {
        if let Err(e) = self.call.hangup(from).await {
            debug!("Hangup on {} server before switch failed: {}", from, e);
        }
        let switched = self.state.update(|s| {
            if s.call_state == CallState::Active {
                return false;
            }
            s.active_server = to;
            s.dial_failure_count = 0;
            true
        });
        if switched {
            info!("Active server switched from {} to {}", from, to);
        } else {
            debug!("Call became active during hangup, switch to {} deferred", to);
        }
        switched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::mocks::MockCallControl;
    use crate::config::ServerProfile;
    use crate::gpio::mocks::MockGpio;
    use crate::network::mocks::MockReachability;
    use crate::network::MockLinkStatusProbe;
    use crate::state::DeviceState;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const NETWORK_LED: PinId = 100;
    const PRIMARY: &str = "10.0.0.5";
    const SECONDARY: &str = "10.0.0.6";

    #[derive(Default)]
    struct CountingDrain {
        calls: AtomicUsize,
    }

    impl DrainTrigger for CountingDrain {
        fn start_drain(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct Fixture {
        state: SharedState,
        reach: MockReachability,
        call: MockCallControl,
        gpio: MockGpio,
        link: Arc<AtomicBool>,
        drain: Arc<CountingDrain>,
        monitor: NetworkMonitor,
    }

    fn servers() -> ServersConfig {
        ServersConfig {
            primary: ServerProfile {
                address: PRIMARY.to_string(),
                ..ServerProfile::default()
            },
            secondary: Some(ServerProfile {
                address: SECONDARY.to_string(),
                ..ServerProfile::default()
            }),
        }
    }

    fn fixture(initial: DeviceState) -> Fixture {
        let state = SharedState::new(initial);
        let reach = MockReachability::new();
        let call = MockCallControl::new();
        let gpio = MockGpio::new();
        let link = Arc::new(AtomicBool::new(true));
        let drain = Arc::new(CountingDrain::default());

        let mut probe = MockLinkStatusProbe::new();
        let link_flag = Arc::clone(&link);
        probe
            .expect_link_up()
            .returning(move || link_flag.load(Ordering::SeqCst));

        let monitor = NetworkMonitor::new(
            state.clone(),
            Arc::new(probe),
            Arc::new(reach.clone()),
            Arc::new(call.clone()),
            Arc::new(gpio.clone()),
            servers(),
            NETWORK_LED,
            Duration::from_millis(100),
        )
        .with_drain(drain.clone());

        Fixture { state, reach, call, gpio, link, drain, monitor }
    }

    fn connected() -> DeviceState {
        DeviceState {
            link_up: true,
            server_reachable: true,
            registration: Registration { primary: true, secondary: true },
            ..DeviceState::default()
        }
    }

    #[tokio::test]
    async fn test_primary_preferred_when_both_reachable() {
        let mut f = fixture(DeviceState {
            active_server: ServerRole::Secondary,
            ..connected()
        });
        f.reach.set(PRIMARY, true);
        f.reach.set(SECONDARY, true);

        let report = f.monitor.tick().await;

        assert_eq!(report.switched_to, Some(ServerRole::Primary));
        assert_eq!(f.state.read(|s| s.active_server), ServerRole::Primary);
        // The call bound to the previous target was torn down first
        assert_eq!(f.call.hangups(), vec![ServerRole::Secondary]);
        // Secondary is not probed while the primary answers
        assert_eq!(f.reach.probed(), vec![PRIMARY.to_string()]);
    }

    #[tokio::test]
    async fn test_failover_to_secondary_resets_failures() {
        let mut f = fixture(DeviceState {
            dial_failure_count: 3,
            ..connected()
        });
        f.reach.set(PRIMARY, false);
        f.reach.set(SECONDARY, true);

        let report = f.monitor.tick().await;

        assert_eq!(report.switched_to, Some(ServerRole::Secondary));
        assert!(report.server_reachable);
        assert_eq!(f.state.read(|s| s.active_server), ServerRole::Secondary);
        assert_eq!(f.state.read(|s| s.dial_failure_count), 0);
    }

    #[tokio::test]
    async fn test_no_switch_during_active_call() {
        let mut f = fixture(DeviceState {
            call_state: CallState::Active,
            ..connected()
        });
        f.reach.set(PRIMARY, false);
        f.reach.set(SECONDARY, true);

        for _ in 0..3 {
            let report = f.monitor.tick().await;
            assert!(report.switch_deferred);
            assert_eq!(f.state.read(|s| s.active_server), ServerRole::Primary);
        }
        assert!(f.call.hangups().is_empty());

        // Call ends: the deferred switch happens on the next tick
        f.state.update(|s| s.call_state = CallState::Idle);
        let report = f.monitor.tick().await;
        assert_eq!(report.switched_to, Some(ServerRole::Secondary));
        assert_eq!(f.state.read(|s| s.active_server), ServerRole::Secondary);
    }

    /// Marks the call Active while the hangup before a switch is in flight
    struct AnswersDuringHangup {
        inner: MockCallControl,
        state: SharedState,
    }

    #[async_trait::async_trait]
    impl CallControl for AnswersDuringHangup {
        async fn dial(&self, server: ServerRole, uri: &str) -> crate::error::Result<()> {
            self.inner.dial(server, uri).await
        }

        async fn hangup(&self, server: ServerRole) -> crate::error::Result<()> {
            self.state.update(|s| s.call_state = CallState::Active);
            self.inner.hangup(server).await
        }

        async fn restart(&self) -> crate::error::Result<()> {
            self.inner.restart().await
        }

        async fn stop(&self) -> crate::error::Result<()> {
            self.inner.stop().await
        }

        fn snapshot(&self) -> crate::call::CallSnapshot {
            self.inner.snapshot()
        }
    }

    #[tokio::test]
    async fn test_switch_deferred_when_call_starts_during_hangup() {
        let state = SharedState::new(connected());
        let reach = MockReachability::new();
        reach.set(PRIMARY, false);
        reach.set(SECONDARY, true);
        let mut probe = MockLinkStatusProbe::new();
        probe.expect_link_up().return_const(true);
        let call = AnswersDuringHangup {
            inner: MockCallControl::new(),
            state: state.clone(),
        };
        let mut monitor = NetworkMonitor::new(
            state.clone(),
            Arc::new(probe),
            Arc::new(reach),
            Arc::new(call),
            Arc::new(MockGpio::new()),
            servers(),
            NETWORK_LED,
            Duration::from_millis(100),
        );

        let report = monitor.tick().await;

        assert!(report.switch_deferred);
        assert_eq!(report.switched_to, None);
        assert_eq!(state.read(|s| s.active_server), ServerRole::Primary);
    }

    #[tokio::test]
    async fn test_probe_flapping_never_leaves_valid_roles() {
        let mut f = fixture(connected());
        let pattern = [(true, false), (false, true), (false, false), (true, true), (false, true)];
        for (primary, secondary) in pattern {
            f.reach.set(PRIMARY, primary);
            f.reach.set(SECONDARY, secondary);
            f.monitor.tick().await;
            let active = f.state.read(|s| s.active_server);
            if primary {
                assert_eq!(active, ServerRole::Primary);
            } else if secondary {
                assert_eq!(active, ServerRole::Secondary);
            }
        }
    }

    #[tokio::test]
    async fn test_link_down_clears_registration() {
        let mut f = fixture(connected());
        f.monitor.tick().await;
        assert_eq!(f.gpio.level(NETWORK_LED), Some(Level::High));

        f.link.store(false, Ordering::SeqCst);
        let report = f.monitor.tick().await;

        assert!(!report.link_up);
        assert!(!report.server_reachable);
        assert!(!f.state.read(|s| s.registration.any()));
        assert_eq!(f.call.hangups(), vec![ServerRole::Primary]);
        assert_eq!(f.gpio.level(NETWORK_LED), Some(Level::Low));
    }

    #[tokio::test]
    async fn test_drain_started_on_reachability_edge_only() {
        let mut f = fixture(DeviceState::default());
        f.reach.set(PRIMARY, false);
        f.monitor.tick().await;
        assert_eq!(f.drain.calls.load(Ordering::SeqCst), 0);

        f.reach.set(PRIMARY, true);
        let report = f.monitor.tick().await;
        assert!(report.drain_started);

        f.monitor.tick().await;
        f.monitor.tick().await;
        assert_eq!(f.drain.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nothing_reachable_keeps_active_server() {
        let mut f = fixture(DeviceState {
            active_server: ServerRole::Secondary,
            ..connected()
        });
        let report = f.monitor.tick().await;

        assert!(!report.server_reachable);
        assert_eq!(report.switched_to, None);
        assert_eq!(f.state.read(|s| s.active_server), ServerRole::Secondary);
    }

    #[tokio::test]
    async fn test_status_file_follows_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ecbstatus");
        let f = fixture(connected());
        f.reach.set(PRIMARY, true);
        let mut monitor = f.monitor.with_status(Arc::new(StatusFile::new(&path)));

        monitor.tick().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("networkStatus-1\n"));
        assert!(contents.contains("prmyLogserverStatus-1\n"));
    }
}
