//! # Application Wiring
//!
//! Builds the workers around one [`SharedState`], schedules their ticks,
//! opens the control sockets and tears everything down exactly once.
//!
//! Startup order: queue recovery, timers (fatal on failure), workers, control
//! sockets (logged and skipped on failure). Shutdown order: timers, worker
//! wakes and sockets, worker joins, command clients, running drain, call
//! subsystem.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::AudioPlayer;
use crate::call::watchdog::CallWatchdog;
use crate::call::{CallControl, Dialer, ErrorPrompts};
use crate::config::Config;
use crate::control::{CommandHandler, DiscoveryResponder};
use crate::error::Result;
use crate::gpio::monitor::{GpioMonitor, MonitorPins};
use crate::gpio::GpioPort;
use crate::network::monitor::NetworkMonitor;
use crate::network::{LinkStatusProbe, ReachabilityProbe};
use crate::panel::PanelReader;
use crate::scheduler::{Scheduler, TimerMode, Wake};
use crate::state::{DeviceState, SharedState};
use crate::status::StatusFile;
use crate::telemetry::{LocalQueue, PipelineSettings, TelemetryPipeline, TelemetryTransport};

/// Hardware and process boundaries the core talks to
#[derive(Clone)]
pub struct Collaborators {
    pub gpio: Arc<dyn GpioPort>,
    pub call: Arc<dyn CallControl>,
    pub audio: Arc<dyn AudioPlayer>,
    pub link: Arc<dyn LinkStatusProbe>,
    pub reachability: Arc<dyn ReachabilityProbe>,
    pub transport: Arc<dyn TelemetryTransport>,
    pub panel: Option<Arc<dyn PanelReader>>,
}

/// Running application
pub struct App {
    state: SharedState,
    scheduler: Scheduler,
    wakes: Vec<Wake>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pipeline: TelemetryPipeline,
    commands: Arc<CommandHandler>,
    call: Arc<dyn CallControl>,
    command_addr: Option<SocketAddr>,
    sockets: CancellationToken,
    kill: CancellationToken,
    stopping: AtomicBool,
    stopped: CancellationToken,
}

impl App {
    /// Start every worker
    ///
    /// # Errors
    ///
    /// Fails only when the scheduler cannot create the polling timers.
    pub async fn start(config: &Config, mac: String, collab: Collaborators) -> Result<Self> {
        let state = SharedState::new(DeviceState::default());
        let status = Arc::new(StatusFile::new(&config.paths.status_file));

        let dialer = Arc::new(Dialer::new(
            state.clone(),
            Arc::clone(&collab.call),
            Arc::clone(&collab.audio),
            config.servers.clone(),
            config.device.dial_number.clone(),
            ErrorPrompts {
                connection: PathBuf::from(&config.paths.connection_error_sound),
                server: PathBuf::from(&config.paths.server_error_sound),
                repeat: config.device.error_play_count,
            },
        ));

        let pipeline = TelemetryPipeline::new(
            state.clone(),
            Arc::clone(&collab.transport),
            collab.panel.clone(),
            LocalQueue::new(&config.paths.queue_file),
            config.servers.clone(),
            PipelineSettings {
                mac,
                din_pins: config.gpio.telemetry_pins.clone(),
                last_log: Some(PathBuf::from(&config.paths.last_log_file)),
            },
        );
        if let Err(e) = pipeline.recover().await {
            warn!("Not able to inspect the local queue: {}", e);
        }

        let gpio_wake = Wake::new();
        let call_wake = Wake::new();
        let network_wake = Wake::new();
        let telemetry_wake = Wake::new();

        let scheduler = Scheduler::new();
        let timing = &config.timing;
        scheduler.schedule(timing.gpio_poll(), TimerMode::Periodic, gpio_wake.clone())?;
        scheduler.schedule(timing.call_check(), TimerMode::Periodic, call_wake.clone())?;
        scheduler.schedule(timing.network_check(), TimerMode::Periodic, network_wake.clone())?;
        scheduler.schedule(timing.telemetry_interval(), TimerMode::Periodic, telemetry_wake.clone())?;

        let gpio_monitor = GpioMonitor::new(
            state.clone(),
            Arc::clone(&collab.gpio),
            MonitorPins::from(&config.gpio),
            Arc::clone(&dialer),
            Arc::clone(&collab.audio),
            &config.device,
        )
        .with_telemetry_wake(telemetry_wake.clone());

        let watchdog = CallWatchdog::new(
            state.clone(),
            Arc::clone(&collab.call),
            Arc::clone(&collab.gpio),
            config.gpio.call_led,
            timing.dial_failure_threshold,
        )
        .with_status(Arc::clone(&status));

        let network = NetworkMonitor::new(
            state.clone(),
            collab.link,
            collab.reachability,
            Arc::clone(&collab.call),
            Arc::clone(&collab.gpio),
            config.servers.clone(),
            config.gpio.network_led,
            timing.probe_timeout(),
        )
        .with_status(status)
        .with_drain(Arc::new(pipeline.clone()));

        let mut workers = vec![
            tokio::spawn(gpio_monitor.run(gpio_wake.clone())),
            tokio::spawn(watchdog.run(call_wake.clone())),
            tokio::spawn(network.run(network_wake.clone())),
            tokio::spawn(pipeline.clone().run(telemetry_wake.clone())),
        ];

        // Learn link and server state right away instead of after one interval
        network_wake.wake();

        let sockets = CancellationToken::new();
        let kill = CancellationToken::new();

        let handler = Arc::new(CommandHandler::new(dialer, pipeline.clone(), kill.clone()));
        let mut command_addr = None;
        match TcpListener::bind(("0.0.0.0", config.control.command_port)).await {
            Ok(listener) => {
                command_addr = listener.local_addr().ok();
                workers.push(tokio::spawn(Arc::clone(&handler).serve(listener, sockets.clone())));
            }
            Err(e) => warn!("Command socket on port {} unavailable: {}", config.control.command_port, e),
        }

        match UdpSocket::bind(("0.0.0.0", config.control.discovery_port)).await {
            Ok(socket) => {
                if let Err(e) = socket.set_broadcast(true) {
                    debug!("Discovery socket broadcast flag not set: {}", e);
                }
                let responder = DiscoveryResponder::new(
                    &config.device,
                    config.control.discovery_reply_port,
                    timing.delivery_timeout(),
                );
                workers.push(tokio::spawn(responder.serve(socket, sockets.clone())));
            }
            Err(e) => warn!("Discovery on port {} unavailable: {}", config.control.discovery_port, e),
        }

        info!("Callbox started with {} workers", workers.len());

        Ok(Self {
            state,
            scheduler,
            wakes: vec![gpio_wake, call_wake, network_wake, telemetry_wake],
            workers: Mutex::new(workers),
            pipeline,
            commands: handler,
            call: collab.call,
            command_addr,
            sockets,
            kill,
            stopping: AtomicBool::new(false),
            stopped: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn pipeline(&self) -> &TelemetryPipeline {
        &self.pipeline
    }

    /// Bound address of the command socket, if it could be opened
    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.command_addr
    }

    /// Resolves once a `KILL` command has been received
    pub async fn shutdown_requested(&self) {
        self.kill.cancelled().await
    }

    /// Stop everything; concurrent and repeated calls tear down only once
    ///
    /// Returns `true` for the call that performed the teardown. Every other
    /// caller waits until the teardown has finished and gets `false`.
    pub async fn shutdown(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            self.stopped.cancelled().await;
            return false;
        }
        info!("Shutting down");

        self.scheduler.shutdown();
        for wake in &self.wakes {
            wake.close();
        }
        self.sockets.cancel();

        let workers: Vec<_> = {
            let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
        self.commands.close_connections().await;

        if let Some(report) = self.pipeline.join_drain().await {
            debug!("Final drain: {:?}", report);
        }

        if let Err(e) = self.call.stop().await {
            warn!("Call subsystem did not stop cleanly: {}", e);
        }

        self.stopped.cancel();
        info!("Shutdown complete");
        true
    }
}
