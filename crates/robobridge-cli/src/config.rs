//! Bridge configuration – reads `~/.robobridge/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use robobridge_middleware::BrokerConfig;
use robobridge_types::BridgeError;
use serde::Deserialize;

/// Persisted bridge configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Host name or IP of the MQTT broker. Required.
    #[serde(default)]
    pub broker_host: String,

    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    /// MQTT client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub broker_username: String,

    /// Broker password (stored as plain text – restrict permissions on the
    /// config file).
    #[serde(default)]
    pub broker_password: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// First reconnect delay after the broker connection drops.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the doubling reconnect delay.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// HTTP + WebSocket port for the control front-end.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Directory holding `index.html`, `menu.html`, `manual.html`, …
    #[serde(default = "default_frontend_dir")]
    pub frontend_dir: PathBuf,

    /// Command run once at startup to bring the broker up. Empty disables it.
    #[serde(default = "default_broker_start_command")]
    pub broker_start_command: Vec<String>,

    /// Command run once on shutdown to stop the broker. Empty disables it.
    #[serde(default = "default_broker_stop_command")]
    pub broker_stop_command: Vec<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("broker_host", &self.broker_host)
            .field("broker_port", &self.broker_port)
            .field("client_id", &self.client_id)
            .field("broker_username", &self.broker_username)
            .field(
                "broker_password",
                if self.broker_password.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("reconnect_initial_ms", &self.reconnect_initial_ms)
            .field("reconnect_max_ms", &self.reconnect_max_ms)
            .field("listen_port", &self.listen_port)
            .field("frontend_dir", &self.frontend_dir)
            .field("broker_start_command", &self.broker_start_command)
            .field("broker_stop_command", &self.broker_stop_command)
            .finish()
    }
}

fn default_broker_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "robobridge".to_string()
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_listen_port() -> u16 {
    3000
}
fn default_frontend_dir() -> PathBuf {
    PathBuf::from("frontend")
}
fn default_broker_start_command() -> Vec<String> {
    vec!["docker".to_string(), "start".to_string(), "mosquitto".to_string()]
}
fn default_broker_stop_command() -> Vec<String> {
    vec!["docker".to_string(), "stop".to_string(), "mosquitto".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_host: String::new(),
            broker_port: default_broker_port(),
            client_id: default_client_id(),
            broker_username: String::new(),
            broker_password: String::new(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            listen_port: default_listen_port(),
            frontend_dir: default_frontend_dir(),
            broker_start_command: default_broker_start_command(),
            broker_stop_command: default_broker_stop_command(),
        }
    }
}

impl Config {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.broker_host.trim().is_empty() {
            return Err(BridgeError::Config(
                "broker_host is not set (config file or ROBOBRIDGE_BROKER_HOST)".to_string(),
            ));
        }
        if self.broker_port == 0 {
            return Err(BridgeError::Config("broker_port must not be 0".to_string()));
        }
        if self.listen_port == 0 {
            return Err(BridgeError::Config("listen_port must not be 0".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(BridgeError::Config("client_id must not be empty".to_string()));
        }
        if !self.broker_password.is_empty() && self.broker_username.is_empty() {
            return Err(BridgeError::Config("broker_password is set without broker_username".to_string()));
        }
        Ok(())
    }

    /// Connection parameters for the broker client.
    pub fn broker_config(&self) -> BrokerConfig {
        let mut broker = BrokerConfig::new(self.broker_host.trim(), self.broker_port);
        broker.client_id = self.client_id.clone();
        broker.keep_alive = Duration::from_secs(self.keep_alive_secs);
        broker.reconnect_initial = Duration::from_millis(self.reconnect_initial_ms);
        broker.reconnect_max = Duration::from_millis(self.reconnect_max_ms);
        if !self.broker_username.is_empty() {
            broker.credentials = Some((self.broker_username.clone(), self.broker_password.clone()));
        }
        broker
    }
}

/// Return the path to `~/.robobridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".robobridge").join("config.toml")
}

/// Load, apply `ROBOBRIDGE_*` overrides and validate.
///
/// `explicit` (the first CLI argument) must exist when given; the default
/// path may be absent, in which case defaults plus environment are used.
pub fn load(explicit: Option<&Path>) -> Result<Config, BridgeError> {
    let mut cfg = match explicit {
        Some(path) => load_from(path)?.ok_or_else(|| {
            BridgeError::Config(format!("config file {} does not exist", path.display()))
        })?,
        None => load_from(&config_path())?.unwrap_or_default(),
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Load the config from a specific path. Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("failed to read config at {}: {}", path.display(), e)))?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse config at {}: {}", path.display(), e)))?;
    Ok(Some(cfg))
}

/// Apply `ROBOBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROBOBRIDGE_BROKER_HOST` | `broker_host` |
/// | `ROBOBRIDGE_BROKER_PORT` | `broker_port` |
/// | `ROBOBRIDGE_CLIENT_ID` | `client_id` |
/// | `ROBOBRIDGE_BROKER_USERNAME` | `broker_username` |
/// | `ROBOBRIDGE_BROKER_PASSWORD` | `broker_password` |
/// | `ROBOBRIDGE_LISTEN_PORT` | `listen_port` |
/// | `ROBOBRIDGE_FRONTEND_DIR` | `frontend_dir` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup, so tests don't
/// have to mutate the process environment.
pub(crate) fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("ROBOBRIDGE_BROKER_HOST") {
        cfg.broker_host = v;
    }
    if let Some(v) = lookup("ROBOBRIDGE_BROKER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker_port = port;
    }
    if let Some(v) = lookup("ROBOBRIDGE_CLIENT_ID") {
        cfg.client_id = v;
    }
    if let Some(v) = lookup("ROBOBRIDGE_BROKER_USERNAME") {
        cfg.broker_username = v;
    }
    if let Some(v) = lookup("ROBOBRIDGE_BROKER_PASSWORD") {
        cfg.broker_password = v;
    }
    if let Some(v) = lookup("ROBOBRIDGE_LISTEN_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.listen_port = port;
    }
    if let Some(v) = lookup("ROBOBRIDGE_FRONTEND_DIR") {
        cfg.frontend_dir = PathBuf::from(v);
    }
}
