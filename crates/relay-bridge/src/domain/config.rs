//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! It is read from a TOML file and then selectively overridden by CLI
//! arguments (see `main.rs`).
//!
//! # Example file
//!
//! ```toml
//! log_level = "info"
//!
//! [server]
//! bind_address = "0.0.0.0"
//! ws_port = 7125
//! http_port = 7126
//! max_send_queue = 256
//!
//! [upstream]
//! socket_path = "/tmp/control.sock"
//! reconnect_interval_secs = 2
//! call_timeout_secs = 30
//!
//! [job_queue]
//! load_on_startup = true
//! automatic_transition = true
//! job_transition_delay = 5.0
//! job_transition_gcode = "M118 next job"
//!
//! [authorization]
//! trusted_clients = ["dashboard"]
//!
//! [topic]
//! enabled = true
//! instance_name = "shop-floor-1"
//! status_objects = ["print_stats", "toolhead"]
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "...")]` so a partial file (or no
//! file at all) still produces a complete configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A bind address and port did not form a valid socket address.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub job_queue: JobQueueConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub topic: TopicConfig,
}

/// Client-facing listeners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address both listeners bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// WebSocket (duplex) port.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// HTTP (request-response) port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Outbound messages a duplex client may have queued before it is
    /// disconnected as too slow.
    #[serde(default = "default_max_send_queue")]
    pub max_send_queue: usize,
}

/// The control-process channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Unix-domain socket the control process listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Deadline for a single upstream call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Retry period for a subscription that failed to sync upstream.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
}

/// Job queue behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobQueueConfig {
    /// Start in `ready` (true) or `paused` (false).
    #[serde(default)]
    pub load_on_startup: bool,
    /// Load the next job automatically after one completes.
    #[serde(default)]
    pub automatic_transition: bool,
    /// Seconds to wait before loading a job.
    #[serde(default)]
    pub job_transition_delay: f64,
    /// Script sent upstream before each job is started.  Empty means none.
    #[serde(default)]
    pub job_transition_gcode: String,
    /// File the queue is persisted to.  Absent means in memory only.
    #[serde(default)]
    pub queue_file: Option<PathBuf>,
}

/// Who may perform privileged calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationConfig {
    /// Client names that are authorized as soon as they identify.
    #[serde(default)]
    pub trusted_clients: Vec<String>,
    /// Token that authorizes any identifying client presenting it.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Topic transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Prefix of every topic this instance uses.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// Objects published continuously on the status topic (all attributes).
    #[serde(default)]
    pub status_objects: Vec<String>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_ws_port() -> u16 {
    7125
}
fn default_http_port() -> u16 {
    7126
}
fn default_max_send_queue() -> usize {
    256
}
fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/control.sock")
}
fn default_reconnect_interval_secs() -> u64 {
    2
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_resync_interval_secs() -> u64 {
    5
}
fn default_instance_name() -> String {
    "relay".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            job_queue: JobQueueConfig::default(),
            authorization: AuthorizationConfig::default(),
            topic: TopicConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ws_port: default_ws_port(),
            http_port: default_http_port(),
            max_send_queue: default_max_send_queue(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            resync_interval_secs: default_resync_interval_secs(),
        }
    }
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            load_on_startup: false,
            automatic_transition: false,
            job_transition_delay: 0.0,
            job_transition_gcode: String::new(),
            queue_file: None,
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_name: default_instance_name(),
            status_objects: Vec::new(),
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl ServerConfig {
    /// WebSocket listen address.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`] if `bind_address` is not an IP.
    pub fn ws_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.bind_address, self.ws_port)
    }

    /// HTTP listen address.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`] if `bind_address` is not an IP.
    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.bind_address, self.http_port)
    }
}

impl UpstreamConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

impl JobQueueConfig {
    /// Transition delay as a `Duration`; negative or non-finite values mean
    /// no delay.
    pub fn transition_delay(&self) -> Duration {
        if self.job_transition_delay.is_finite() && self.job_transition_delay > 0.0 {
            Duration::from_secs_f64(self.job_transition_delay)
        } else {
            Duration::ZERO
        }
    }
}

fn socket_addr(ip: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let text = format!("{ip}:{port}");
    text.parse().map_err(|_| ConfigError::InvalidAddress(text))
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads `BridgeConfig` from `path`, returning the defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BridgeConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        // Arrange / Act
        let cfg = BridgeConfig::default();

        // Assert
        assert_eq!(cfg.server.ws_addr().unwrap().port(), 7125);
        assert_eq!(cfg.server.http_addr().unwrap().port(), 7126);
    }

    #[test]
    fn test_default_job_queue_starts_paused_without_chaining() {
        let cfg = JobQueueConfig::default();
        assert!(!cfg.load_on_startup);
        assert!(!cfg.automatic_transition);
        assert_eq!(cfg.transition_delay(), Duration::ZERO);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        // Arrange: only one section, one key
        let text = "[job_queue]\nautomatic_transition = true\n";

        // Act
        let cfg: BridgeConfig = toml::from_str(text).unwrap();

        // Assert
        assert!(cfg.job_queue.automatic_transition);
        assert_eq!(cfg.server.max_send_queue, 256);
        assert_eq!(cfg.upstream.call_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_full_file_parses_every_section() {
        let text = r#"
            log_level = "debug"

            [server]
            bind_address = "127.0.0.1"
            ws_port = 9000

            [upstream]
            socket_path = "/run/ctl.sock"
            call_timeout_secs = 5

            [job_queue]
            load_on_startup = true
            job_transition_delay = 1.5
            job_transition_gcode = "HOME"
            queue_file = "/var/lib/relay/queue.toml"

            [authorization]
            trusted_clients = ["dash"]
            api_key = "k"

            [topic]
            enabled = true
            instance_name = "lab"
            status_objects = ["print_stats"]
        "#;

        let cfg: BridgeConfig = toml::from_str(text).unwrap();

        assert_eq!(cfg.server.ws_addr().unwrap().to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.upstream.socket_path, PathBuf::from("/run/ctl.sock"));
        assert_eq!(cfg.job_queue.transition_delay(), Duration::from_millis(1500));
        assert_eq!(cfg.authorization.api_key.as_deref(), Some("k"));
        assert_eq!(cfg.topic.status_objects, vec!["print_stats".to_string()]);
    }

    #[test]
    fn test_invalid_bind_address_is_error() {
        let cfg = ServerConfig {
            bind_address: "not.an.ip".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.ws_addr(), Err(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn test_negative_delay_means_none() {
        let cfg = JobQueueConfig {
            job_transition_delay: -3.0,
            ..JobQueueConfig::default()
        };
        assert_eq!(cfg.transition_delay(), Duration::ZERO);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let path = std::env::temp_dir().join("relay-bridge-config-does-not-exist.toml");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg, BridgeConfig::default());
    }
}
