//! MQTT client implementation over rumqttc
//!
//! The client is split into pure decision logic and the impure event loop:
//!
//! - [`connection`] - Connection state, backoff and rumqttc options
//! - [`message_handler`] - Translation of rumqttc events into routes
//! - [`health_monitor`] - Reconnection decisions and state transitions
//! - [`client`] - The supervisor task and the [`Transport`](crate::transport::Transport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use thingsync::config::ThingConfig;
//! use thingsync::router::TopicRouter;
//! use thingsync::transport::mqtt::MqttClient;
//! use std::path::Path;
//!
//! # tokio_test::block_on(async {
//! let config = ThingConfig::load_from_file(Path::new("thing.toml"))?;
//! let router = TopicRouter::new();
//!
//! let mut client = MqttClient::new(&config.mqtt_id(), &config.mqtt)?;
//! client.connect(router.clone()).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
