//! Transport layer for the thing session
//!
//! This module provides the publish/subscribe abstraction the core is written
//! against and the rumqttc-backed MQTT implementation of it.

use bytes::Bytes;

pub mod mqtt;

pub use mqtt::MqttError;

/// A message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Transport trait for the thing session
///
/// Inbound delivery is not part of the trait: implementations push every
/// received message into the session's [`TopicRouter`](crate::router::TopicRouter).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    /// Subscribe to a topic filter (wildcards allowed)
    async fn subscribe(&self, filter: &str) -> Result<(), MqttError>;

    /// Remove a subscription previously made with the same filter
    async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError>;
}
