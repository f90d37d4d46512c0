//! Shared-connection capability object
//!
//! A [`ThingSession`] is created once per connection and handed as an `Arc`
//! to every shadow, jobs directory and job handle. It owns the routing table
//! and reference-counts broker subscriptions, so two pending calls that need
//! the same filter never unsubscribe each other.

use crate::config::ThingConfig;
use crate::error::{CallError, ThingResult};
use crate::protocol::{ThingName, ThingTopics, TopicMatch};
use crate::router::{Handler, RouteId, TopicRouter};
use crate::transport::mqtt::{MqttClient, MqttError};
use crate::transport::Transport;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection-wide state shared by every component of one thing
pub struct ThingSession {
    thing: ThingName,
    topics: ThingTopics,
    client_token: String,
    table: Arc<SubscriptionTable>,
}

struct SubscriptionTable {
    transport: Arc<dyn Transport>,
    router: TopicRouter,
    // Guards transport subscribe/unsubscribe; never held while a call waits
    counts: Mutex<HashMap<String, usize>>,
}

impl SubscriptionTable {
    async fn acquire(&self, filter: &str) -> Result<(), MqttError> {
        let mut counts = self.counts.lock().await;
        let current = counts.get(filter).copied().unwrap_or(0);
        if current == 0 {
            self.transport.subscribe(filter).await?;
            debug!(target: "session", filter, "Subscribed");
        }
        counts.insert(filter.to_string(), current + 1);
        Ok(())
    }

    async fn release(&self, filter: &str) -> Result<(), MqttError> {
        let mut counts = self.counts.lock().await;
        match counts.get_mut(filter) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                counts.remove(filter);
                debug!(target: "session", filter, "Unsubscribing");
                self.transport.unsubscribe(filter).await
            }
            None => Ok(()),
        }
    }
}

impl ThingSession {
    /// Build a session over an already-connected transport
    ///
    /// `router` must be the router the transport delivers inbound messages to.
    /// Without an explicit client token a random one is generated.
    pub fn new(
        thing: ThingName,
        client_token: Option<String>,
        transport: Arc<dyn Transport>,
        router: TopicRouter,
    ) -> Arc<Self> {
        let client_token = client_token.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Arc::new(Self {
            topics: ThingTopics::new(&thing),
            thing,
            client_token,
            table: Arc::new(SubscriptionTable {
                transport,
                router,
                counts: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Connect to the configured endpoint and build a session over it
    pub async fn connect(config: &ThingConfig) -> ThingResult<(Arc<Self>, Arc<MqttClient>)> {
        let router = TopicRouter::new();
        let mut client = MqttClient::new(&config.thing.mqtt_id(), &config.mqtt)?;
        client.connect(router.clone()).await?;
        let client = Arc::new(client);

        info!(thing = %config.thing.name, "Thing session established");
        let session = Self::new(
            config.thing.name.clone(),
            config.thing.client_token.clone(),
            client.clone(),
            router,
        );
        Ok((session, client))
    }

    pub fn thing(&self) -> &ThingName {
        &self.thing
    }

    pub fn topics(&self) -> &ThingTopics {
        &self.topics
    }

    pub fn client_token(&self) -> &str {
        &self.client_token
    }

    pub fn router(&self) -> &TopicRouter {
        &self.table.router
    }

    /// Register a route, then make sure `filter` is subscribed
    ///
    /// The route is live before the SUBSCRIBE goes out, so nothing delivered
    /// after the broker accepts the subscription can be missed.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        rule: TopicMatch,
        handler: Handler,
    ) -> Result<Subscription, MqttError> {
        let filter = filter.into();
        let id = self.table.router.register(rule, handler);

        if let Err(e) = self.table.acquire(&filter).await {
            self.table.router.unregister(id);
            return Err(e);
        }

        Ok(Subscription {
            id,
            filter,
            table: Arc::clone(&self.table),
            released: false,
        })
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        debug!(target: "session", topic, bytes = payload.len(), "Publishing");
        self.table.transport.publish(topic, payload).await
    }

    pub async fn publish_json<T: Serialize>(&self, topic: &str, body: &T) -> Result<(), CallError> {
        let payload = serde_json::to_vec(body)?;
        self.publish(topic, payload).await?;
        Ok(())
    }

    /// Filters currently subscribed through this session, with their counts
    pub async fn active_filters(&self) -> HashMap<String, usize> {
        self.table.counts.lock().await.clone()
    }
}

impl fmt::Debug for ThingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThingSession")
            .field("thing", &self.thing)
            .field("router", &self.table.router)
            .finish_non_exhaustive()
    }
}

/// A live route plus its share of a broker subscription
///
/// Call [`Subscription::release`] to tear it down. Dropping it unreleased
/// (for example when a waiting future is cancelled) removes the route
/// immediately and unsubscribes in the background.
#[must_use = "dropping a Subscription tears the route down"]
pub struct Subscription {
    id: RouteId,
    filter: String,
    table: Arc<SubscriptionTable>,
    released: bool,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub async fn release(mut self) -> Result<(), MqttError> {
        self.released = true;
        self.table.router.unregister(self.id);
        let filter = std::mem::take(&mut self.filter);
        self.table.release(&filter).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.table.router.unregister(self.id);

        let table = Arc::clone(&self.table);
        let filter = std::mem::take(&mut self.filter);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = table.release(&filter).await {
                        warn!(target: "session", filter, "Deferred unsubscribe failed: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!(target: "session", filter, "Subscription dropped outside a runtime; filter left subscribed");
            }
        }
    }
}
