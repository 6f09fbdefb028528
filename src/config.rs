// Configuration for the chat core
// Loaded from a JSON file in the user's config directory, with env overrides

use anyhow::{anyhow, Result};
use log::{debug, info};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR_NAME: &str = "tutorchat";
const CONFIG_FILE_NAME: &str = "config.json";

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Websocket endpoint of the messaging backend
    pub server_url: String,
    /// Base URL of the REST API serving the roster
    pub api_base_url: String,
    /// Roster path template, `{id}` is replaced with the identity id
    pub roster_path: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Capacity of the connection event queue
    pub event_buffer: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            server_url: "wss://skill-backend.jassy.in/chat".to_string(),
            api_base_url: "https://skill-backend.jassy.in".to_string(),
            roster_path: "/tutor/getStudents/{id}".to_string(),
            request_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 15_000,
            event_buffer: 100,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Bounded, jittered exponential backoff for reconnect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay applied as random jitter in both directions
    pub jitter: f64,
    /// Consecutive failed retries before the connection is given up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 5,
        }
    }
}

impl ChatConfig {
    /// Load the configuration from `path`, or from the default location when
    /// `None`. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => get_config_path()?,
        };

        let mut config = if config_path.exists() {
            let mut file = File::open(&config_path)?;
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let config: ChatConfig = serde_json::from_str(&contents)
                .map_err(|e| anyhow!("Invalid config file {}: {}", config_path.display(), e))?;
            info!("Loaded chat configuration from {}", config_path.display());
            config
        } else {
            debug!("No config file at {}, using defaults", config_path.display());
            ChatConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TUTORCHAT_SERVER_URL") {
            debug!("Server URL overridden from environment");
            self.server_url = url;
        }
        if let Ok(url) = std::env::var("TUTORCHAT_API_BASE_URL") {
            debug!("API base URL overridden from environment");
            self.api_base_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 || self.ack_timeout_ms == 0 {
            return Err(anyhow!("Timeouts must be greater than zero"));
        }
        if self.event_buffer == 0 {
            return Err(anyhow!("event_buffer must be greater than zero"));
        }
        if !(self.reconnect.multiplier >= 1.0 && self.reconnect.multiplier.is_finite()) {
            return Err(anyhow!("reconnect.multiplier must be a finite number of at least 1.0"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(anyhow!("reconnect.max_attempts must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return Err(anyhow!("reconnect.jitter must be within [0, 1)"));
        }
        if !self.roster_path.contains("{id}") {
            return Err(anyhow!("roster_path must contain the {{id}} placeholder"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(CONFIG_DIR_NAME);

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Point every later default-location load at `path`. Only the first call
/// in a process takes effect.
pub fn set_config_path_override(path: PathBuf) -> bool {
    CONFIG_PATH_OVERRIDE.set(path).is_ok()
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}
