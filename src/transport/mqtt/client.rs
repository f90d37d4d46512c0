//! Impure I/O operations for MQTT client
//!
//! This module owns the rumqttc client and the supervisor task that polls
//! its event loop. The supervisor is the delivery path: every inbound
//! PUBLISH is handed to the [`TopicRouter`] from that task.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::router::TopicRouter;
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of rumqttc's request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// MQTT transport client for one thing
pub struct MqttClient {
    mqtt_id: String,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    // EventLoop is Send but not Sync; the mutex keeps the client shareable
    event_loop: std::sync::Mutex<Option<EventLoop>>,
    event_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    // Filters replayed after every ConnAck
    subscribed_topics: Arc<Mutex<Vec<String>>>,
}

impl MqttClient {
    pub fn new(mqtt_id: &str, config: &MqttSection) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(mqtt_id, config)?;

        Ok(MqttClient {
            mqtt_id: mqtt_id.to_string(),
            config: config.clone(),
            reconnect_config: ReconnectConfig::from(&config.reconnect),
            client: Arc::new(Mutex::new(client)),
            event_loop: std::sync::Mutex::new(Some(event_loop)),
            event_loop_handle: std::sync::Mutex::new(None),
            state_rx: None,
            shutdown_tx: None,
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Helper method to create new MQTT connection and event loop
    /// Used for initial connection and reconnection attempts
    fn create_connection(
        mqtt_id: &str,
        config: &MqttSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(mqtt_id, config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Start the supervisor and return once the broker acknowledged the connection
    ///
    /// Inbound messages are dispatched to `router` from then on, across
    /// reconnects, until [`MqttClient::disconnect`] or permanent failure.
    pub async fn connect(&mut self, router: TopicRouter) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                MqttError::ConnectionFailedStr("Event loop already started".to_string())
            })?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            mqtt_id: self.mqtt_id.clone(),
            config: self.config.clone(),
            reconnect_config: self.reconnect_config.clone(),
            client: Arc::clone(&self.client),
            subscribed_topics: Arc::clone(&self.subscribed_topics),
            router,
            state_tx,
            shutdown_rx,
            reconnect_attempts: 0,
        };
        let span = crate::mqtt_span!(mqtt_id = %self.mqtt_id);
        let handle = tokio::spawn(supervisor.run(event_loop).instrument(span));
        *self
            .event_loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let connection_timeout = HealthMonitor::calculate_connection_timeout(
            &self.reconnect_config,
            self.config.connect_timeout(),
        );
        Self::wait_for_connection_confirmation(state_rx, connection_timeout).await?;
        info!(mqtt_id = %self.mqtt_id, endpoint = %self.config.endpoint_url, "MQTT connected");
        Ok(())
    }

    /// Stop the supervisor and disconnect from the broker
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            debug!("Sent shutdown signal to MQTT supervisor");
        }

        let connected = self
            .connection_state()
            .is_some_and(|state| HealthMonitor::can_publish(&state));
        if connected {
            let client = self.client.lock().await;
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        }

        let handle = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("MQTT supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("MQTT supervisor ended with error: {}", e);
                }
                Err(_) => warn!("MQTT supervisor didn't shut down in time"),
                _ => {}
            }
        }

        info!(mqtt_id = %self.mqtt_id, "MQTT client disconnected");
        Ok(())
    }

    /// Get current connection state
    /// Returns None if connection hasn't been established yet
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Check if the connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let client = self.client.lock().await;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
        self.check_connection_state()?;

        {
            let client = self.client.lock().await;
            client.subscribe(filter, QoS::AtLeastOnce).await.map_err(|e| {
                MqttError::SubscriptionFailed(format!("Failed to subscribe to {filter}: {e}").into())
            })?;
        }

        let mut topics = self.subscribed_topics.lock().await;
        if !topics.iter().any(|t| t == filter) {
            topics.push(filter.to_string());
        }
        debug!(target: "mqtt_transport", filter, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        self.subscribed_topics.lock().await.retain(|t| t != filter);

        // A dead connection holds no subscriptions; nothing to undo
        if self.check_connection_state().is_err() {
            return Ok(());
        }
        let client = self.client.lock().await;
        client.unsubscribe(filter).await.map_err(|e| {
            MqttError::SubscriptionFailed(format!("Failed to unsubscribe from {filter}: {e}").into())
        })
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        let handle = self
            .event_loop_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Event loop owner running on its own task
struct Supervisor {
    mqtt_id: String,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    router: TopicRouter,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!("Starting MQTT event loop supervisor");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT supervisor");
                        break;
                    }
                }
                event_result = event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut event_loop).await
                        }
                        Err(e) => {
                            self.set_state(ConnectionEvent::NetworkError(e.to_string()));
                            self.reconnect(&mut event_loop).await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!("MQTT event loop stopped");
    }

    fn set_state(&self, event: ConnectionEvent) {
        let _ = self.state_tx.send(HealthMonitor::determine_next_state(event));
    }

    /// Returns false when the loop should stop
    async fn process_event_route(&mut self, route: EventRoute, event_loop: &mut EventLoop) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.set_state(ConnectionEvent::ConnAckReceived);
                self.reconnect_attempts = 0;
                self.resubscribe_to_topics().await;
                true
            }
            EventRoute::MessageReceived(message) => {
                debug!(target: "mqtt_transport", topic = %message.topic, "Received MQTT message");
                self.router.dispatch(&message);
                true
            }
            EventRoute::Disconnected => {
                self.set_state(ConnectionEvent::DisconnectedByBroker);
                self.reconnect(event_loop).await
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Replay tracked filters on a fresh connection
    ///
    /// Uses the non-blocking request path: the event loop that drains the
    /// request channel is the caller.
    async fn resubscribe_to_topics(&self) {
        let topics = self.subscribed_topics.lock().await.clone();
        if topics.is_empty() {
            return;
        }
        let client = self.client.lock().await;
        for topic in &topics {
            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Back off, then swap in a fresh client and event loop
    /// Returns false when the loop should stop
    async fn reconnect(&mut self, event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.set_state(ConnectionEvent::ReconnectionStarted(attempt));

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !Self::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                match MqttClient::create_connection(&self.mqtt_id, &self.config) {
                    Ok((new_client, new_event_loop)) => {
                        *event_loop = new_event_loop;
                        *self.client.lock().await = new_client;
                        debug!("Swapped in a new MQTT connection");
                    }
                    Err(e) => error!("Failed to create new connection: {}", e),
                }
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts } => {
                self.set_state(ConnectionEvent::PermanentFailure(format!(
                    "Max reconnection attempts ({max_attempts}) exceeded"
                )));
                false
            }
        }
    }
}
