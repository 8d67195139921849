//! # Callbox
//!
//! Control daemon for a SIP intercom call box.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Load the TOML configuration (built-in defaults if it is unusable)
//!    - Set up logging to stdout or a daily-rolling file
//!    - Export GPIO pins, render the SIP accounts file, launch the user agent
//!    - Synchronize the clock with the primary server
//!
//! 2. **Run**
//!    - Polling loops, command socket and discovery run until Ctrl+C or `KILL`
//!
//! 3. **Graceful Shutdown**
//!    - Stop timers and workers, finish a running drain, stop the user agent

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use callbox::app::{App, Collaborators};
use callbox::audio::AlsaAudio;
use callbox::call::user_agent::{write_accounts, ProcessUserAgent};
use callbox::config::{Config, GpioConfig, LoggingConfig};
use callbox::gpio::SysfsGpio;
use callbox::network::{read_mac, PingProbe, SysfsCarrier};
use callbox::panel::{PanelReader, SerialPanel};
use callbox::telemetry::HttpTransport;
use callbox::timesync::{sync_clock, SystemClock};

const DEFAULT_CONFIG_PATH: &str = "/etc/callbox/callbox.toml";
const CONFIG_ENV: &str = "CALLBOX_CONFIG";

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into()
}

fn load_config(path: &Path) -> (Config, Option<String>) {
    match Config::load(path) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(format!("{}: {}", path.display(), e))),
    }
}

/// Install the subscriber; keep the returned guard alive to flush file logs
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("callbox={}", logging.level)));

    match &logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "callbox.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

/// Export every configured pin; returns how many were exported
fn export_gpio(gpio: &SysfsGpio, config: &GpioConfig) -> usize {
    let outputs = config.outputs();
    let total = config.inputs.len() + outputs.len();
    let failed = gpio.export_all(&config.inputs, &outputs);
    if failed > 0 {
        warn!("{} of {} GPIO pins could not be exported", failed, total);
    } else {
        info!("Exported {} GPIO pins", total);
    }
    total - failed
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let (config, config_error) = load_config(&path);
    let _log_guard = init_logging(&config.logging);

    info!("Callbox v{} starting...", env!("CARGO_PKG_VERSION"));
    match config_error {
        Some(e) => warn!("Configuration unusable, running on defaults: {}", e),
        None => info!("Configuration loaded from {}", path.display()),
    }

    let mac = read_mac(Path::new(&config.network.sysfs_net_root), &config.device.interface)
        .unwrap_or_else(|| {
            warn!("MAC of {} unavailable, using {}", config.device.interface, config.device.mac);
            config.device.mac.clone()
        });
    info!("Device {} ({})", config.device.description, mac);

    let gpio = SysfsGpio::new(&config.gpio.sysfs_root);
    export_gpio(&gpio, &config.gpio);

    if let Err(e) = write_accounts(&config.paths.accounts_file, &config.servers).await {
        warn!("Not able to write SIP accounts to {}: {}", config.paths.accounts_file, e);
    }
    let user_agent = Arc::new(ProcessUserAgent::new(config.user_agent.clone(), &config.servers));
    if let Err(e) = user_agent.start().await {
        warn!("User agent {} did not start: {}", config.user_agent.program, e);
    }

    let transport = Arc::new(HttpTransport::new(config.timing.delivery_timeout()));
    sync_clock(&transport, &config.servers.primary, &SystemClock).await;

    let panel: Option<Arc<dyn PanelReader>> = if config.panel.enabled {
        Some(Arc::new(SerialPanel::new(config.panel.clone())))
    } else {
        None
    };

    let collab = Collaborators {
        gpio: Arc::new(gpio),
        call: user_agent,
        audio: Arc::new(AlsaAudio::new()),
        link: Arc::new(SysfsCarrier::new(
            &config.network.sysfs_net_root,
            config.network.carrier_interfaces.clone(),
        )),
        reachability: Arc::new(PingProbe::new()),
        transport,
        panel,
    };

    let app = App::start(&config, mac, collab).await?;
    info!("Press Ctrl+C to exit");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
        _ = app.shutdown_requested() => info!("Shutdown requested over the command socket"),
    }

    app.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_unusable_config_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[servers.primary\naddress = ").unwrap();

        let (config, error) = load_config(file.path());

        assert!(error.is_some());
        assert_eq!(config.control.command_port, 5500);
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let (config, error) = load_config(Path::new("/nonexistent/callbox.toml"));
        assert!(error.unwrap().contains("/nonexistent/callbox.toml"));
        assert_eq!(config.device.dial_number, "174");
    }

    #[test]
    fn test_export_gpio_counts_exported_pins() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = GpioConfig {
            sysfs_root: dir.path().display().to_string(),
            ..Config::default().gpio
        };
        let gpio = SysfsGpio::new(&config.sysfs_root);
        assert_eq!(export_gpio(&gpio, &config), 0);

        std::fs::create_dir(dir.path().join(format!("gpio{}", config.inputs[0]))).unwrap();
        assert_eq!(export_gpio(&gpio, &config), 1);
    }
}
