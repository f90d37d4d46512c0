//! Pure connection state management for MQTT client
//!
//! This module contains connection state, reconnection backoff and the
//! translation of an [`MqttSection`] into rumqttc options.

use crate::config::MqttSection;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// AWS IoT rejects packets above 128 KiB
const MAX_PACKET_SIZE: u32 = 128 * 1024;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, indexed by attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Calculate backoff delay for given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpointUrl(String),
    #[error("Failed to load certificate {path:?}: {source}")]
    CertificateLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

fn read_pem(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::CertificateLoad {
        path: path.to_path_buf(),
        source,
    })
}

fn required_path<'a>(path: &'a Option<PathBuf>, field: &str) -> Result<&'a Path, MqttError> {
    path.as_deref().ok_or_else(|| {
        MqttError::ConnectionFailedStr(format!("mqtts endpoint requires {field}"))
    })
}

/// Pure function to configure MQTT options from config
///
/// `mqtts` endpoints get mutual TLS from the configured PEM files. The MQTT
/// client id is used as given, since AWS IoT policies usually pin it.
pub fn configure_mqtt_options(mqtt_id: &str, config: &MqttSection) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.endpoint_url)
        .map_err(|_| MqttError::InvalidEndpointUrl(config.endpoint_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidEndpointUrl(config.endpoint_url.clone()))?;
    let tls = url.scheme() == "mqtts";
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(mqtt_id, host, port);

    if tls {
        let ca = read_pem(required_path(&config.ca_cert_path, "ca_cert_path")?)?;
        let cert = read_pem(required_path(&config.client_cert_path, "client_cert_path")?)?;
        let key = read_pem(required_path(&config.private_key_path, "private_key_path")?)?;
        mqtt_options.set_transport(RumqttcTransport::tls(ca, Some((cert, key)), None));
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectSection;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_pattern, vec![25, 50, 100, 250]);
        assert_eq!(config.sustained_delay, 250);
    }

    #[test]
    fn test_calculate_max_total_time() {
        let config = ReconnectConfig {
            max_attempts: Some(6),
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        };
        // 25 + 50 + 100 + 250 + 250 + 250
        assert_eq!(config.calculate_max_total_time(), Some(925));

        assert_eq!(ReconnectConfig::default().calculate_max_total_time(), None);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(2), 50);
        assert_eq!(config.calculate_backoff_delay(3), 100);
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_backoff_delay(5), 250);
        assert_eq!(config.calculate_backoff_delay(100), 250);

        let flat = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: Vec::new(),
            sustained_delay: 40,
        };
        assert_eq!(flat.calculate_backoff_delay(1), 40);
    }

    #[test]
    fn test_connection_state_equality() {
        assert_eq!(ConnectionState::Connected, ConnectionState::Connected);
        assert_ne!(
            ConnectionState::Connected,
            ConnectionState::Disconnected("test".to_string())
        );
    }

    fn plain_config() -> MqttSection {
        MqttSection {
            endpoint_url: "mqtt://localhost:1883".to_string(),
            ca_cert_path: None,
            client_cert_path: None,
            private_key_path: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 30,
            reconnect: ReconnectSection::default(),
        }
    }

    #[test]
    fn test_configure_plain_options() {
        let options = configure_mqtt_options("thing-1", &plain_config()).unwrap();
        assert_eq!(options.client_id(), "thing-1");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_endpoint_url() {
        let mut config = plain_config();
        config.endpoint_url = "invalid-url".to_string();

        let result = configure_mqtt_options("thing-1", &config);
        assert!(matches!(result, Err(MqttError::InvalidEndpointUrl(_))));
    }

    #[test]
    fn test_missing_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = plain_config();
        config.endpoint_url = "mqtts://example.com".to_string();
        config.ca_cert_path = Some(dir.path().join("missing-ca.pem"));
        config.client_cert_path = Some(dir.path().join("cert.pem"));
        config.private_key_path = Some(dir.path().join("key.pem"));

        match configure_mqtt_options("thing-1", &config) {
            Err(MqttError::CertificateLoad { path, .. }) => {
                assert!(path.ends_with("missing-ca.pem"));
            }
            other => panic!("expected certificate error, got {other:?}"),
        }
    }

    #[test]
    fn test_tls_options_from_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ca.pem", "cert.pem", "key.pem"] {
            std::fs::write(dir.path().join(name), b"-----BEGIN TEST-----\n").unwrap();
        }
        let mut config = plain_config();
        config.endpoint_url = "mqtts://example.com".to_string();
        config.ca_cert_path = Some(dir.path().join("ca.pem"));
        config.client_cert_path = Some(dir.path().join("cert.pem"));
        config.private_key_path = Some(dir.path().join("key.pem"));

        let options = configure_mqtt_options("thing-1", &config).unwrap();
        assert_eq!(options.broker_address(), ("example.com".to_string(), 8883));
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::InvalidEndpointUrl("test".to_string()),
            MqttError::NotConnected {
                state: ConnectionState::Disconnected("test".to_string()),
            },
            MqttError::ConnectionFailedStr("test".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
