use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_INSTANCE_NAME, DEFAULT_SERVICE_TYPE, TXT_HELLO};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mdisco/mdiscod.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub mdns: MdnsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Empty means "local."
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_instance_name")]
    pub name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub domain: String,
    /// Fixed port to advertise. When unset the responder listens on an
    /// ephemeral port and advertises that.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub initial_record: BTreeMap<String, String>,
    #[serde(default = "default_self_update_delay")]
    pub self_update_delay_ms: u64,
    /// Record written once after publication; empty disables the update
    #[serde(default = "default_self_update_record")]
    pub self_update_record: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MdnsConfig {
    /// Restrict the daemon to one interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}

fn default_instance_name() -> String {
    DEFAULT_INSTANCE_NAME.to_string()
}

fn default_resolve_timeout() -> u64 {
    3000
}

fn default_self_update_delay() -> u64 {
    2000
}

fn default_self_update_record() -> BTreeMap<String, String> {
    BTreeMap::from([(TXT_HELLO.to_string(), "world".to_string())])
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

fn default_log_capacity() -> usize {
    1000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: default_service_type(),
            domain: String::new(),
            resolve_timeout_ms: default_resolve_timeout(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_instance_name(),
            service_type: default_service_type(),
            domain: String::new(),
            port: None,
            initial_record: BTreeMap::new(),
            self_update_delay_ms: default_self_update_delay(),
            self_update_record: default_self_update_record(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl DiscoveryConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

impl PublishConfig {
    pub fn self_update_delay(&self) -> Duration {
        Duration::from_millis(self.self_update_delay_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load an explicitly given path, or the default path if it exists,
    /// otherwise fall back to built-in defaults.
    pub fn load_or_default(explicit: Option<PathBuf>) -> Result<(Self, Option<PathBuf>)> {
        match explicit {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => {
                let path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Ok((Self::load(&path)?, Some(path)))
                } else {
                    Ok((Self::default(), None))
                }
            }
        }
    }
}
