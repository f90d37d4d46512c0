//! Correlated request/response over publish/subscribe
//!
//! Correlation is by topic: the response topic family already identifies the
//! thing and job a response belongs to. Each call owns a fresh one-shot
//! channel, so no result can leak from one call into the next, and the route
//! is torn down on every exit path before the outcome is returned.

use crate::error::CallError;
use crate::protocol::{ErrorResponse, TopicMatch};
use crate::router::Handler;
use crate::session::ThingSession;
use crate::transport::InboundMessage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn, Instrument};

/// Everything needed to issue one correlated call
#[derive(Debug, Clone)]
pub struct CorrelatedRequest {
    pub request_topic: String,
    pub payload: Vec<u8>,
    /// Broker subscription the response arrives through
    pub response_filter: String,
    /// Finer routing rule applied to messages on that subscription
    pub response_rule: TopicMatch,
    pub timeout: Duration,
}

impl CorrelatedRequest {
    pub fn json<T: Serialize>(
        request_topic: impl Into<String>,
        body: &T,
        response_filter: impl Into<String>,
        response_rule: TopicMatch,
        timeout: Duration,
    ) -> Result<Self, CallError> {
        Ok(Self {
            request_topic: request_topic.into(),
            payload: serde_json::to_vec(body)?,
            response_filter: response_filter.into(),
            response_rule,
            timeout,
        })
    }
}

/// Publish a request and wait for the first matching response
///
/// Later matches for the same call (duplicates, or anything arriving while
/// the route is being removed) are dropped.
pub async fn call(
    session: &ThingSession,
    request: CorrelatedRequest,
) -> Result<InboundMessage, CallError> {
    let span = crate::call_span!(
        thing = %session.thing(),
        request_topic = %request.request_topic,
        rule = %request.response_rule
    );
    call_inner(session, request).instrument(span).await
}

async fn call_inner(
    session: &ThingSession,
    request: CorrelatedRequest,
) -> Result<InboundMessage, CallError> {
    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some(tx)));
    let handler_slot = Arc::clone(&slot);
    let handler: Handler = Arc::new(move |message: &InboundMessage| {
        let sender = handler_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => {
                let _ = sender.send(message.clone());
            }
            None => debug!(topic = %message.topic, "Dropping repeated response"),
        }
    });

    let subscription = session
        .subscribe(
            request.response_filter.clone(),
            request.response_rule.clone(),
            handler,
        )
        .await?;

    let outcome = publish_and_wait(session, &request, rx).await;

    if let Err(e) = subscription.release().await {
        warn!("Failed to release response subscription: {}", e);
    }
    outcome
}

async fn publish_and_wait(
    session: &ThingSession,
    request: &CorrelatedRequest,
    rx: oneshot::Receiver<InboundMessage>,
) -> Result<InboundMessage, CallError> {
    session
        .publish(&request.request_topic, request.payload.clone())
        .await?;

    match tokio::time::timeout(request.timeout, rx).await {
        Ok(Ok(message)) => {
            debug!(topic = %message.topic, "Correlated response received");
            Ok(message)
        }
        // The sender only goes away with the route, which is still held here
        Ok(Err(_)) | Err(_) => {
            warn!(timeout = ?request.timeout, "No correlated response before deadline");
            Err(CallError::Timeout {
                topic: request.response_filter.clone(),
                timeout: request.timeout,
            })
        }
    }
}

/// Decode a JSON response body, mapping failures to [`CallError::Malformed`]
pub fn decode<T: DeserializeOwned>(message: &InboundMessage) -> Result<T, CallError> {
    serde_json::from_slice(&message.payload)
        .map_err(|e| CallError::malformed(&message.topic, e.to_string()))
}

/// Turn a `.../rejected` response into [`CallError::Rejected`]
///
/// An undecodable rejection body still counts as a rejection.
pub fn rejection(message: &InboundMessage) -> CallError {
    let body: ErrorResponse = serde_json::from_slice(&message.payload).unwrap_or_default();
    warn!(
        topic = %message.topic,
        code = body.code.as_deref().unwrap_or("-"),
        "Request rejected by service"
    );
    CallError::Rejected {
        topic: message.topic.clone(),
        code: body.code,
        message: body.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ThingName;
    use crate::router::TopicRouter;
    use crate::testing::MockTransport;
    use serde_json::json;

    fn session() -> (Arc<ThingSession>, Arc<MockTransport>) {
        let router = TopicRouter::new();
        let mock = Arc::new(MockTransport::new(router.clone()));
        let session = ThingSession::new(
            ThingName::new("corr").unwrap(),
            Some("tok".to_string()),
            mock.clone(),
            router,
        );
        (session, mock)
    }

    fn request(timeout_ms: u64) -> CorrelatedRequest {
        CorrelatedRequest::json(
            "req/get",
            &json!({"clientToken": "tok"}),
            "req/get/+",
            TopicMatch::Child("req/get".to_string()),
            Duration::from_millis(timeout_ms),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_call_returns_first_response() {
        let (session, mock) = session();
        mock.reply_to("req/get", "req/get/accepted", json!({"n": 1}))
            .await;

        let message = call(&session, request(500)).await.unwrap();

        assert_eq!(message.topic, "req/get/accepted");
        let body: serde_json::Value = decode(&message).unwrap();
        assert_eq!(body, json!({"n": 1}));
        assert!(session.router().is_empty());
        assert!(session.active_filters().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_responses_are_dropped() {
        let (session, mock) = session();
        mock.reply_to("req/get", "req/get/accepted", json!({"n": 1}))
            .await;
        mock.reply_to("req/get", "req/get/accepted", json!({"n": 2}))
            .await;

        let message = call(&session, request(500)).await.unwrap();
        let body: serde_json::Value = decode(&message).unwrap();
        assert_eq!(body, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_timeout_cleans_up() {
        let (session, mock) = session();

        let result = call(&session, request(30)).await;

        assert!(matches!(result, Err(CallError::Timeout { .. })));
        assert!(session.router().is_empty());
        assert_eq!(mock.unsubscribe_calls().await, vec!["req/get/+".to_string()]);
        // A late response reaches nobody
        assert_eq!(
            mock.deliver_unfiltered("req/get/accepted", json!({})).await,
            0
        );
    }

    #[tokio::test]
    async fn test_publish_failure_cleans_up() {
        let (session, mock) = session();
        mock.set_fail_publish(true);

        let result = call(&session, request(500)).await;

        assert!(matches!(result, Err(CallError::Transport(_))));
        assert!(session.router().is_empty());
        assert!(session.active_filters().await.is_empty());
    }

    #[test]
    fn test_decode_malformed() {
        let message = InboundMessage::new("a/accepted", "not json");
        let result: Result<serde_json::Value, _> = decode(&message);
        assert!(matches!(result, Err(CallError::Malformed { .. })));
    }

    #[test]
    fn test_rejection_parsing() {
        let message = InboundMessage::new(
            "a/rejected",
            r#"{"code":"VersionMismatch","message":"expected 2"}"#,
        );
        match rejection(&message) {
            CallError::Rejected { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("VersionMismatch"));
                assert_eq!(message.as_deref(), Some("expected 2"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let garbage = InboundMessage::new("a/rejected", "<html>");
        assert!(matches!(rejection(&garbage), CallError::Rejected { code: None, .. }));
    }
}
