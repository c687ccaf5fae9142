//! # Configuration Management Module
//!
//! Centralized configuration for the gateway: dispatch tuning, the device
//! roster, storage location, SMTP forwarding, and logging. Files are TOML,
//! deserialized with serde and validated on load.
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gateway]
//! buffer_max_size = 50
//! buffer_low_count = 10
//! loader_timeout_minutes = 5
//! loader_countout = 20
//! loader_long_timeout_minutes = 60
//!
//! [[devices]]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//! id = "modem0"
//!
//! [storage]
//! db_path = "smsgate.db"
//!
//! [smtp]
//! enabled = false
//!
//! [logging]
//! level = "info"
//! file = "smsgate.log"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub devices: Vec<DeviceConfig>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    pub logging: LoggingConfig,
}

/// Dispatch engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Capacity of the in-memory outbound queue.
    pub buffer_max_size: usize,
    /// Low-water mark below which the loader replenishes from storage.
    pub buffer_low_count: usize,
    /// Minutes of quiet after which an enqueue forces a loader wakeup.
    pub loader_timeout_minutes: u64,
    /// Enqueue count that forces a loader wakeup regardless of timing.
    pub loader_countout: u64,
    /// Minutes between unforced loader wakeups. Messages that failed with no
    /// follow-up traffic would otherwise stall until the next API call.
    pub loader_long_timeout_minutes: u64,
}

/// One serial-attached modem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    pub id: String,
}

fn default_baud() -> u32 {
    115200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
}

/// Email forwarding of incoming messages. Disabled unless configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Authenticate with AUTH PLAIN before sending.
    #[serde(default)]
    pub auth: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub recipient: String,
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_smtp_host(),
            port: default_smtp_port(),
            auth: false,
            username: String::new(),
            password: String::new(),
            sender: String::new(),
            recipient: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file.
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject configurations the dispatch engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(anyhow!("at least one [[devices]] entry is required"));
        }
        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(anyhow!("device id must not be empty"));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(anyhow!("duplicate device id '{}'", device.id));
            }
            if device.port.is_empty() {
                return Err(anyhow!("device '{}' has no serial port", device.id));
            }
        }
        if self.gateway.buffer_max_size == 0 {
            return Err(anyhow!("gateway.buffer_max_size must be positive"));
        }
        if self.gateway.buffer_low_count >= self.gateway.buffer_max_size {
            return Err(anyhow!(
                "gateway.buffer_low_count must be below buffer_max_size"
            ));
        }
        if self.smtp.enabled && (self.smtp.sender.is_empty() || self.smtp.recipient.is_empty()) {
            return Err(anyhow!("smtp forwarding requires sender and recipient"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewayConfig {
                buffer_max_size: 50,
                buffer_low_count: 10,
                loader_timeout_minutes: 5,
                loader_countout: 20,
                loader_long_timeout_minutes: 60,
            },
            devices: vec![DeviceConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud: 115200,
                id: "modem0".to_string(),
            }],
            storage: StorageConfig {
                db_path: "smsgate.db".to_string(),
            },
            smtp: SmtpConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("smsgate.log".to_string()),
            },
        }
    }
}
