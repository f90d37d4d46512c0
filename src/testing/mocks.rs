//! Mock implementations for testing
//!
//! Provides an in-memory broker implementing [`Transport`] so the shadow and
//! jobs components can be exercised without a network connection.

use crate::protocol::{topic_matches_filter, ThingName};
use crate::router::TopicRouter;
use crate::session::ThingSession;
use crate::transport::{InboundMessage, MqttError, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Vec<u8>);

/// Builds a reply body from the request body
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
enum ReplyBody {
    Fixed(Vec<u8>),
    Computed(Responder),
}

impl ReplyBody {
    fn render(&self, request: &[u8]) -> Vec<u8> {
        match self {
            ReplyBody::Fixed(payload) => payload.clone(),
            ReplyBody::Computed(responder) => responder(request),
        }
    }
}

impl std::fmt::Debug for ReplyBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyBody::Fixed(payload) => write!(f, "Fixed({} bytes)", payload.len()),
            ReplyBody::Computed(_) => f.write_str("Computed"),
        }
    }
}

#[derive(Debug, Clone)]
struct ScriptedReply {
    request_topic: String,
    reply_topic: String,
    body: ReplyBody,
}

/// In-memory broker for testing
///
/// Deliveries honor the active subscription filters like a real broker
/// would, except through [`MockTransport::deliver_unfiltered`], which feeds
/// the router directly to observe routing-level cleanup.
#[derive(Debug)]
pub struct MockTransport {
    router: TopicRouter,
    published: Mutex<Vec<PublishedMessage>>,
    subscribe_calls: Mutex<Vec<String>>,
    unsubscribe_calls: Mutex<Vec<String>>,
    active: Mutex<Vec<String>>,
    replies: Mutex<Vec<ScriptedReply>>,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
}

impl MockTransport {
    pub fn new(router: TopicRouter) -> Self {
        Self {
            router,
            published: Mutex::new(Vec::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
        }
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Answer every publish on `request_topic` with `payload` on `reply_topic`
    pub async fn reply_to(&self, request_topic: &str, reply_topic: &str, payload: Value) {
        self.reply_raw(request_topic, reply_topic, payload.to_string().into_bytes())
            .await;
    }

    pub async fn reply_raw(&self, request_topic: &str, reply_topic: &str, payload: Vec<u8>) {
        self.push_reply(request_topic, reply_topic, ReplyBody::Fixed(payload))
            .await;
    }

    /// Answer every publish on `request_topic` with `responder(request)`
    pub async fn reply_with<F>(&self, request_topic: &str, reply_topic: &str, responder: F)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let responder: Responder = Arc::new(move |request: &[u8]| {
            let request = serde_json::from_slice(request).unwrap_or(Value::Null);
            responder(&request).to_string().into_bytes()
        });
        self.push_reply(request_topic, reply_topic, ReplyBody::Computed(responder))
            .await;
    }

    async fn push_reply(&self, request_topic: &str, reply_topic: &str, body: ReplyBody) {
        self.replies.lock().await.push(ScriptedReply {
            request_topic: request_topic.to_string(),
            reply_topic: reply_topic.to_string(),
            body,
        });
    }

    pub async fn clear_replies(&self) {
        self.replies.lock().await.clear();
    }

    /// Deliver a JSON message if some active subscription covers `topic`
    pub async fn deliver(&self, topic: &str, payload: Value) -> usize {
        self.deliver_raw(topic, payload.to_string()).await
    }

    pub async fn deliver_raw(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let subscribed = self
            .active
            .lock()
            .await
            .iter()
            .any(|filter| topic_matches_filter(filter, topic));
        if !subscribed {
            return 0;
        }
        self.router.dispatch(&InboundMessage::new(topic, payload))
    }

    /// Feed the router directly, ignoring broker subscription state
    pub async fn deliver_unfiltered(&self, topic: &str, payload: Value) -> usize {
        self.router
            .dispatch(&InboundMessage::new(topic, payload.to_string()))
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// JSON bodies published on `topic`, oldest first
    pub async fn published_on(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    /// Poll until at least `count` messages were published on `topic`
    pub async fn wait_for_published(&self, topic: &str, count: usize, timeout: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let bodies = self.published_on(topic).await;
            if bodies.len() >= count || tokio::time::Instant::now() >= deadline {
                return bodies;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn subscribe_calls(&self) -> Vec<String> {
        self.subscribe_calls.lock().await.clone()
    }

    pub async fn unsubscribe_calls(&self) -> Vec<String> {
        self.unsubscribe_calls.lock().await.clone()
    }

    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.active.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
        self.subscribe_calls.lock().await.clear();
        self.unsubscribe_calls.lock().await.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload.clone()));

        let replies: Vec<ScriptedReply> = self
            .replies
            .lock()
            .await
            .iter()
            .filter(|reply| reply.request_topic == topic)
            .cloned()
            .collect();
        for reply in replies {
            self.deliver_raw(&reply.reply_topic, reply.body.render(&payload))
                .await;
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MqttError::SubscriptionFailed(
                "Mock subscription failure".into(),
            ));
        }
        self.subscribe_calls.lock().await.push(filter.to_string());
        self.active.lock().await.push(filter.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        self.unsubscribe_calls.lock().await.push(filter.to_string());
        let mut active = self.active.lock().await;
        if let Some(index) = active.iter().position(|f| f == filter) {
            active.remove(index);
        }
        Ok(())
    }
}

/// Session wired to a fresh [`MockTransport`] with client token `test-token`
pub fn mock_session(thing: &str) -> (Arc<ThingSession>, Arc<MockTransport>) {
    let router = TopicRouter::new();
    let mock = Arc::new(MockTransport::new(router.clone()));
    let thing = ThingName::new(thing).unwrap_or_else(|e| panic!("invalid test thing name: {e}"));
    let session = ThingSession::new(thing, Some("test-token".to_string()), mock.clone(), router);
    (session, mock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TopicMatch;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_delivery_requires_subscription() {
        let router = TopicRouter::new();
        let mock = MockTransport::new(router.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        router.register(
            TopicMatch::Prefix("a".to_string()),
            Arc::new(move |_msg: &InboundMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(mock.deliver("a/b", json!({})).await, 0);
        mock.subscribe("a/+").await.unwrap();
        assert_eq!(mock.deliver("a/b", json!({})).await, 1);
        mock.unsubscribe("a/+").await.unwrap();
        assert_eq!(mock.deliver("a/b", json!({})).await, 0);
        assert_eq!(mock.deliver_unfiltered("a/b", json!({})).await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_records_nothing() {
        let mock = MockTransport::new(TopicRouter::new());
        mock.set_fail_publish(true);
        assert!(mock.publish("t", b"{}".to_vec()).await.is_err());
        assert!(mock.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_published_on_filters_by_topic() {
        let mock = MockTransport::new(TopicRouter::new());
        mock.publish("a", br#"{"n":1}"#.to_vec()).await.unwrap();
        mock.publish("b", br#"{"n":2}"#.to_vec()).await.unwrap();
        assert_eq!(mock.published_on("a").await, vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_computed_reply_sees_request() {
        let router = TopicRouter::new();
        let mock = MockTransport::new(router.clone());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router.register(
            TopicMatch::Exact("req/echo".to_string()),
            Arc::new(move |msg: &InboundMessage| {
                sink.lock().unwrap().push(msg.payload.clone());
            }),
        );
        mock.subscribe("req/echo").await.unwrap();
        mock.reply_with("req", "req/echo", |request| json!({"echo": request["n"]}))
            .await;

        mock.publish("req", br#"{"n":7}"#.to_vec()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let body: Value = serde_json::from_slice(&seen[0]).unwrap();
        assert_eq!(body, json!({"echo": 7}));
    }
}
