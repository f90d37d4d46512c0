//! Pure reconnection logic for MQTT client
//!
//! Decides whether the supervisor reconnects, how long it waits first, and
//! which [`ConnectionState`] a connection event leads to.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info};

/// Pure reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts };
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// How long `connect()` waits for the first ConnAck
    ///
    /// With limited retries the whole backoff schedule fits inside the wait.
    pub fn calculate_connection_timeout(config: &ReconnectConfig, base: Duration) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => base + Duration::from_millis(max_total_time),
            None => base,
        }
    }

    /// Determine next state after connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => {
                info!(target: "mqtt_transport", "MQTT client connected");
                ConnectionState::Connected
            }
            ConnectionEvent::DisconnectedByBroker => {
                info!(target: "mqtt_transport", "MQTT broker closed the connection");
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => {
                error!(target: "mqtt_transport", "MQTT event loop error: {}", error);
                ConnectionState::Disconnected(error)
            }
            ConnectionEvent::ReconnectionStarted(attempt) => {
                info!(target: "mqtt_transport", attempt, "Starting reconnection attempt");
                ConnectionState::Reconnecting(attempt)
            }
            ConnectionEvent::PermanentFailure(reason) => {
                error!(target: "mqtt_transport", "Permanent connection failure: {}", reason);
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Check if connection state allows publishing and subscribing
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded { max_attempts: u32 },
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}
