//! Configuration system for a thing
//!
//! The primary format is a TOML file. The device-side `thing.conf.json`
//! (`{"endpoint", "mqttid", "thingname"}`) is accepted as well, with the
//! certificate files expected next to it.

use crate::jobs::JobsProtocol;
use crate::protocol::{ThingName, ValidationError};
use crate::transport::mqtt::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Paths searched when no config file is given explicitly
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["thing.toml", "config/thing.toml"];

const AWS_IOT_PORT: u16 = 8883;

/// Main thing configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThingConfig {
    pub thing: ThingSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub ota: OtaSection,
}

/// Thing identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThingSection {
    /// Thing name every topic is namespaced by
    pub name: ThingName,
    /// MQTT client id, defaults to the thing name
    pub mqtt_id: Option<String>,
    /// Client token carried in jobs requests, random when absent
    pub client_token: Option<String>,
}

impl ThingSection {
    pub fn mqtt_id(&self) -> String {
        self.mqtt_id
            .clone()
            .unwrap_or_else(|| self.name.as_str().to_string())
    }
}

/// MQTT endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Endpoint URL, `mqtts://host:8883` or `mqtt://host:1883`
    pub endpoint_url: String,
    /// CA certificate (PEM)
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate (PEM)
    pub client_cert_path: Option<PathBuf>,
    /// Client private key (PEM)
    pub private_key_path: Option<PathBuf>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

impl MqttSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn is_tls(&self) -> bool {
        self.endpoint_url.starts_with("mqtts://")
    }
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

/// Reconnection backoff as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Attempts before giving up; unlimited when absent
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

fn default_backoff_ms() -> Vec<u64> {
    vec![25, 50, 100, 250]
}

fn default_sustained_delay_ms() -> u64 {
    250
}

/// Jobs behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsSection {
    #[serde(default)]
    pub protocol: JobsProtocol,
    /// Deadline for every correlated jobs call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Ask the service to echo the job document in update acknowledgments
    #[serde(default)]
    pub include_job_document: bool,
    /// Directory poll period used by `run`
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            protocol: JobsProtocol::default(),
            call_timeout_ms: default_call_timeout_ms(),
            include_job_document: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl JobsSection {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

/// Firmware update settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OtaSection {
    /// Version of the firmware currently running
    #[serde(default)]
    pub firmware_version: u64,
    /// Command started with the target version to begin an update
    pub update_command: Option<String>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid thing name: {0}")]
    InvalidThingName(#[from] ValidationError),
    #[error("No config file found (searched {searched:?})")]
    NotFound { searched: Vec<PathBuf> },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Shape of the device-side `thing.conf.json`
#[derive(Debug, Deserialize)]
struct DeviceConf {
    endpoint: String,
    mqttid: String,
    thingname: Option<String>,
}

impl ThingConfig {
    /// Load a configuration file, TOML or `thing.conf.json` by extension
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            Self::from_device_conf(&content, base)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Load the explicit path, or the first default path that exists
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        let searched: Vec<PathBuf> = DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect();
        match searched.iter().find(|path| path.is_file()) {
            Some(path) => Self::load_from_file(path),
            None => Err(ConfigError::NotFound { searched }),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ThingConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `thing.conf.json`
    ///
    /// Certificates are looked up in `base` under the file names the
    /// device tooling provisions.
    pub fn from_device_conf(content: &str, base: &Path) -> Result<Self, ConfigError> {
        let conf: DeviceConf = serde_json::from_str(content)?;
        let name = ThingName::new(conf.thingname.unwrap_or_else(|| conf.mqttid.clone()))?;

        let endpoint_url = if conf.endpoint.contains("://") {
            conf.endpoint
        } else {
            format!("mqtts://{}:{AWS_IOT_PORT}", conf.endpoint)
        };

        let config = ThingConfig {
            thing: ThingSection {
                name,
                mqtt_id: Some(conf.mqttid),
                client_token: None,
            },
            mqtt: MqttSection {
                endpoint_url,
                ca_cert_path: Some(base.join("AmazonRootCA1.pem")),
                client_cert_path: Some(base.join("certificate.pem.crt")),
                private_key_path: Some(base.join("private.pem.key")),
                keep_alive_secs: default_keep_alive(),
                connect_timeout_secs: default_connect_timeout(),
                reconnect: ReconnectSection::default(),
            },
            jobs: JobsSection::default(),
            ota: OtaSection::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.mqtt.endpoint_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "endpoint_url '{}' is not a valid URL: {e}",
                self.mqtt.endpoint_url
            ))
        })?;
        match url.scheme() {
            "mqtt" | "mqtts" => {}
            other => {
                return Err(ConfigError::InvalidConfig(format!(
                    "endpoint_url scheme must be mqtt or mqtts, got '{other}'"
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidConfig(
                "endpoint_url must include a host".to_string(),
            ));
        }

        if self.mqtt.is_tls()
            && (self.mqtt.ca_cert_path.is_none()
                || self.mqtt.client_cert_path.is_none()
                || self.mqtt.private_key_path.is_none())
        {
            return Err(ConfigError::InvalidConfig(
                "mqtts endpoints require ca_cert_path, client_cert_path and private_key_path"
                    .to_string(),
            ));
        }

        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0, or omitted for unlimited"
                    .to_string(),
            ));
        }

        if self.jobs.call_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "jobs.call_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.mqtt_id().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "thing.mqtt_id cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn mqtt_id(&self) -> String {
        self.thing.mqtt_id()
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig::from(&self.mqtt.reconnect)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[thing]
name = "test-thing"

[mqtt]
endpoint_url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
