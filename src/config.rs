//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CallboxError, Result};
use crate::state::ServerRole;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    pub servers: ServersConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device identity and audio settings
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_description")]
    pub description: String,

    /// Fallback MAC when the interface address cannot be read
    #[serde(default = "default_mac")]
    pub mac: String,

    /// Address advertised to discovery responders; empty means auto-detect
    #[serde(default)]
    pub ip_addr: String,

    #[serde(default = "default_interface")]
    pub interface: String,

    #[serde(default = "default_dial_number")]
    pub dial_number: String,

    #[serde(default = "default_volume")]
    pub speaker_volume: u8,

    #[serde(default = "default_volume")]
    pub mic_volume: u8,

    #[serde(default = "default_error_play_count")]
    pub error_play_count: u32,
}

/// Primary and optional secondary server profiles
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServersConfig {
    pub primary: ServerProfile,
    #[serde(default)]
    pub secondary: Option<ServerProfile>,
}

/// One SIP + telemetry server. Immutable after load.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerProfile {
    /// SIP registrar address, also used for reachability probes
    pub address: String,

    /// SIP port; `None` lets the user agent pick the default
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub user_id: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_true")]
    pub auto_answer: bool,

    #[serde(default)]
    pub tcp_transport: bool,

    /// Telemetry server address; empty means same as `address`
    #[serde(default)]
    pub telemetry_host: String,

    #[serde(default = "default_telemetry_port")]
    pub telemetry_port: u16,

    #[serde(default = "default_telemetry_path")]
    pub telemetry_path: String,

    #[serde(default = "default_time_sync_path")]
    pub time_sync_path: String,

    #[serde(default)]
    pub secret: String,
}

/// Loop intervals and I/O bounds
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    #[serde(default = "default_gpio_poll_ms")]
    pub gpio_poll_ms: u64,

    #[serde(default = "default_call_check_ms")]
    pub call_check_ms: u64,

    #[serde(default = "default_network_check_ms")]
    pub network_check_ms: u64,

    #[serde(default = "default_telemetry_interval_s")]
    pub telemetry_interval_s: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    #[serde(default = "default_dial_failure_threshold")]
    pub dial_failure_threshold: u32,
}

/// GPIO pin assignment
#[derive(Debug, Deserialize, Clone)]
pub struct GpioConfig {
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,

    /// Every monitored input pin (tamper switches and PTT buttons)
    #[serde(default = "default_inputs")]
    pub inputs: Vec<u32>,

    #[serde(default = "default_ptt_pin")]
    pub ptt_pin: u32,

    /// Level read while the PTT button is pressed (0 or 1)
    #[serde(default)]
    pub ptt_active_level: u8,

    /// Inputs reported as din1..din4, in that order
    #[serde(default = "default_telemetry_pins")]
    pub telemetry_pins: Vec<u32>,

    #[serde(default = "default_registration_led")]
    pub registration_led: u32,

    #[serde(default = "default_call_led")]
    pub call_led: u32,

    #[serde(default = "default_network_led")]
    pub network_led: u32,
}

/// Link carrier sources
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_carrier_interfaces")]
    pub carrier_interfaces: Vec<String>,

    #[serde(default = "default_sysfs_net_root")]
    pub sysfs_net_root: String,
}

/// Panel status serial line
#[derive(Debug, Deserialize, Clone)]
pub struct PanelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_panel_port")]
    pub port: String,

    #[serde(default = "default_panel_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_query_char")]
    pub query_char: char,

    #[serde(default = "default_start_char")]
    pub start_char: char,

    #[serde(default = "default_end_char")]
    pub end_char: char,

    #[serde(default = "default_panel_timeout_ms")]
    pub timeout_ms: u64,
}

/// Files the core reads or writes
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_queue_file")]
    pub queue_file: String,

    #[serde(default = "default_last_log_file")]
    pub last_log_file: String,

    #[serde(default = "default_status_file")]
    pub status_file: String,

    #[serde(default = "default_accounts_file")]
    pub accounts_file: String,

    #[serde(default = "default_connection_error_sound")]
    pub connection_error_sound: String,

    #[serde(default = "default_server_error_sound")]
    pub server_error_sound: String,
}

/// Local command socket and discovery
#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    #[serde(default = "default_command_port")]
    pub command_port: u16,

    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    #[serde(default = "default_discovery_reply_port")]
    pub discovery_reply_port: u16,
}

/// External SIP user agent process
#[derive(Debug, Deserialize, Clone)]
pub struct UserAgentConfig {
    #[serde(default = "default_ua_program")]
    pub program: String,

    #[serde(default = "default_ua_args")]
    pub args: Vec<String>,

    /// ALSA capture status file; contains `closed` when no media session runs
    #[serde(default = "default_capture_status")]
    pub capture_status: String,
}

/// Log output
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Daily-rolling log directory; stdout when unset
    #[serde(default)]
    pub dir: Option<String>,
}

// Default value functions
fn default_true() -> bool { true }

fn default_description() -> String { "Default TollBooth".to_string() }
fn default_mac() -> String { "00:00:00:00:00:00".to_string() }
fn default_interface() -> String { "eth0".to_string() }
fn default_dial_number() -> String { "174".to_string() }
fn default_volume() -> u8 { 10 }
fn default_error_play_count() -> u32 { 3 }

fn default_telemetry_port() -> u16 { 8081 }
fn default_telemetry_path() -> String { "/sececbwebapi/api/GpioLogs".to_string() }
fn default_time_sync_path() -> String { "/sececbwebapi/api/ServerTime".to_string() }

fn default_gpio_poll_ms() -> u64 { 500 }
fn default_call_check_ms() -> u64 { 1000 }
fn default_network_check_ms() -> u64 { 5000 }
fn default_telemetry_interval_s() -> u64 { 30 }
fn default_probe_timeout_ms() -> u64 { 1000 }
fn default_delivery_timeout_ms() -> u64 { 5000 }
fn default_dial_failure_threshold() -> u32 { 5 }

fn default_sysfs_root() -> String { "/sys/class/gpio".to_string() }
fn default_inputs() -> Vec<u32> { vec![96, 137, 98, 133, 132, 129, 136, 128, 131, 135, 130] }
fn default_ptt_pin() -> u32 { 98 }
fn default_telemetry_pins() -> Vec<u32> { vec![129, 136, 133, 132] }
fn default_registration_led() -> u32 { 97 }
fn default_call_led() -> u32 { 99 }
fn default_network_led() -> u32 { 100 }

fn default_carrier_interfaces() -> Vec<String> { vec!["eth0".to_string(), "eth1".to_string()] }
fn default_sysfs_net_root() -> String { "/sys/class/net".to_string() }

fn default_panel_port() -> String { "/dev/ttymxc4".to_string() }
fn default_panel_baud_rate() -> u32 { 9600 }
fn default_query_char() -> char { '*' }
fn default_start_char() -> char { '#' }
fn default_end_char() -> char { '@' }
fn default_panel_timeout_ms() -> u64 { 500 }

fn default_queue_file() -> String { "/usr/bin/locallog.log".to_string() }
fn default_last_log_file() -> String { "/www/lastlog".to_string() }
fn default_status_file() -> String { "/www/ecbstatus".to_string() }
fn default_accounts_file() -> String { "/etc/baresip/accounts".to_string() }
fn default_connection_error_sound() -> String { "/usr/bin/networkcableerr.wav".to_string() }
fn default_server_error_sound() -> String { "/usr/bin/servererr.wav".to_string() }

fn default_command_port() -> u16 { 5500 }
fn default_discovery_port() -> u16 { 7700 }
fn default_discovery_reply_port() -> u16 { 6000 }

fn default_ua_program() -> String { "baresip".to_string() }
fn default_ua_args() -> Vec<String> { vec!["-f".to_string(), "/etc/baresip".to_string()] }
fn default_capture_status() -> String { "/proc/asound/card0/pcm0c/sub0/status".to_string() }

fn default_log_level() -> String { "info".to_string() }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            description: default_description(),
            mac: default_mac(),
            ip_addr: String::new(),
            interface: default_interface(),
            dial_number: default_dial_number(),
            speaker_volume: default_volume(),
            mic_volume: default_volume(),
            error_play_count: default_error_play_count(),
        }
    }
}

impl Default for ServerProfile {
    fn default() -> Self {
        Self {
            address: "192.168.1.10".to_string(),
            port: Some(5060),
            user_id: "110".to_string(),
            password: String::new(),
            auto_answer: true,
            tcp_transport: false,
            telemetry_host: String::new(),
            telemetry_port: default_telemetry_port(),
            telemetry_path: default_telemetry_path(),
            time_sync_path: default_time_sync_path(),
            secret: String::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            gpio_poll_ms: default_gpio_poll_ms(),
            call_check_ms: default_call_check_ms(),
            network_check_ms: default_network_check_ms(),
            telemetry_interval_s: default_telemetry_interval_s(),
            probe_timeout_ms: default_probe_timeout_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            dial_failure_threshold: default_dial_failure_threshold(),
        }
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            inputs: default_inputs(),
            ptt_pin: default_ptt_pin(),
            ptt_active_level: 0,
            telemetry_pins: default_telemetry_pins(),
            registration_led: default_registration_led(),
            call_led: default_call_led(),
            network_led: default_network_led(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            carrier_interfaces: default_carrier_interfaces(),
            sysfs_net_root: default_sysfs_net_root(),
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_panel_port(),
            baud_rate: default_panel_baud_rate(),
            query_char: default_query_char(),
            start_char: default_start_char(),
            end_char: default_end_char(),
            timeout_ms: default_panel_timeout_ms(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            queue_file: default_queue_file(),
            last_log_file: default_last_log_file(),
            status_file: default_status_file(),
            accounts_file: default_accounts_file(),
            connection_error_sound: default_connection_error_sound(),
            server_error_sound: default_server_error_sound(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            command_port: default_command_port(),
            discovery_port: default_discovery_port(),
            discovery_reply_port: default_discovery_reply_port(),
        }
    }
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            program: default_ua_program(),
            args: default_ua_args(),
            capture_status: default_capture_status(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl ServersConfig {
    /// Profile for `role`; `None` when the secondary is not configured
    pub fn profile(&self, role: ServerRole) -> Option<&ServerProfile> {
        match role {
            ServerRole::Primary => Some(&self.primary),
            ServerRole::Secondary => self.secondary.as_ref(),
        }
    }
}

impl ServerProfile {
    /// Host used for telemetry delivery and time sync
    pub fn telemetry_host(&self) -> &str {
        if self.telemetry_host.is_empty() {
            &self.address
        } else {
            &self.telemetry_host
        }
    }

    /// SIP URI used to dial `number` through this server
    ///
    /// # Examples
    ///
    /// ```
    /// use callbox::config::ServerProfile;
    ///
    /// let profile = ServerProfile {
    ///     address: "10.0.0.5".to_string(),
    ///     port: Some(5060),
    ///     ..ServerProfile::default()
    /// };
    /// assert_eq!(profile.dial_uri("174"), "sip:174@10.0.0.5:5060");
    /// ```
    pub fn dial_uri(&self, number: &str) -> String {
        match self.port {
            Some(port) => format!("sip:{}@{}:{}", number, self.address, port),
            None => format!("sip:{}@{}", number, self.address),
        }
    }

    /// Address-of-record registered for this server's account
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.user_id, self.address)
    }
}

impl TimingConfig {
    pub fn gpio_poll(&self) -> Duration { Duration::from_millis(self.gpio_poll_ms) }
    pub fn call_check(&self) -> Duration { Duration::from_millis(self.call_check_ms) }
    pub fn network_check(&self) -> Duration { Duration::from_millis(self.network_check_ms) }
    pub fn telemetry_interval(&self) -> Duration { Duration::from_secs(self.telemetry_interval_s) }
    pub fn probe_timeout(&self) -> Duration { Duration::from_millis(self.probe_timeout_ms) }
    pub fn delivery_timeout(&self) -> Duration { Duration::from_millis(self.delivery_timeout_ms) }
}

impl GpioConfig {
    /// LED pins, driven as outputs
    pub fn outputs(&self) -> Vec<u32> {
        vec![self.registration_led, self.call_led, self.network_led]
    }
}

fn invalid(message: impl std::fmt::Display) -> CallboxError {
    CallboxError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use callbox::config::Config;
    ///
    /// let config = Config::load("/etc/callbox/callbox.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        self.validate_server("primary", &self.servers.primary)?;
        if let Some(secondary) = &self.servers.secondary {
            self.validate_server("secondary", secondary)?;
        }

        for (name, value) in [
            ("gpio_poll_ms", self.timing.gpio_poll_ms),
            ("call_check_ms", self.timing.call_check_ms),
            ("network_check_ms", self.timing.network_check_ms),
            ("telemetry_interval_s", self.timing.telemetry_interval_s),
            ("probe_timeout_ms", self.timing.probe_timeout_ms),
            ("delivery_timeout_ms", self.timing.delivery_timeout_ms),
            ("panel.timeout_ms", self.panel.timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("{} must be greater than 0", name)));
            }
        }

        if self.timing.dial_failure_threshold == 0 {
            return Err(invalid("dial_failure_threshold must be greater than 0"));
        }

        if self.gpio.ptt_active_level > 1 {
            return Err(invalid("ptt_active_level must be 0 or 1"));
        }

        if !self.gpio.inputs.contains(&self.gpio.ptt_pin) {
            return Err(invalid(format!(
                "ptt_pin {} must be listed in gpio.inputs",
                self.gpio.ptt_pin
            )));
        }

        if self.gpio.telemetry_pins.len() > 4 {
            return Err(invalid("at most 4 telemetry_pins (din1..din4) are supported"));
        }

        for pin in &self.gpio.telemetry_pins {
            if !self.gpio.inputs.contains(pin) {
                return Err(invalid(format!(
                    "telemetry pin {} must be listed in gpio.inputs",
                    pin
                )));
            }
        }

        let outputs = self.gpio.outputs();
        let unique: HashSet<u32> = outputs.iter().copied().collect();
        if unique.len() != outputs.len() {
            return Err(invalid("LED output pins must be distinct"));
        }
        if outputs.iter().any(|pin| self.gpio.inputs.contains(pin)) {
            return Err(invalid("an LED output pin cannot also be an input"));
        }

        if self.network.carrier_interfaces.is_empty() {
            return Err(invalid("carrier_interfaces cannot be empty"));
        }

        if self.panel.enabled && self.panel.port.is_empty() {
            return Err(invalid("panel port cannot be empty when enabled"));
        }

        if self.paths.queue_file.is_empty() {
            return Err(invalid("queue_file cannot be empty"));
        }

        if self.control.command_port == 0
            || self.control.discovery_port == 0
            || self.control.discovery_reply_port == 0
        {
            return Err(invalid("control ports must be non-zero"));
        }

        if self.device.dial_number.is_empty() {
            return Err(invalid("dial_number cannot be empty"));
        }

        Ok(())
    }

    fn validate_server(&self, role: &str, profile: &ServerProfile) -> Result<()> {
        if profile.address.is_empty() {
            return Err(invalid(format!("{} server address cannot be empty", role)));
        }
        if profile.telemetry_path.is_empty() {
            return Err(invalid(format!("{} telemetry_path cannot be empty", role)));
        }
        if profile.telemetry_port == 0 {
            return Err(invalid(format!("{} telemetry_port must be non-zero", role)));
        }
        Ok(())
    }
}
