//! Device shadow synchronization
//!
//! Reports are fire-and-forget publishes on `shadow/update`. Deltas arrive
//! on one persistent subscription; the delivery path only queues them, and a
//! worker task runs the reconciliation callback and reports what it returns.

use crate::error::CallError;
use crate::protocol::{DeltaDocument, ShadowReport, StateMap, TopicMatch};
use crate::router::Handler;
use crate::session::{Subscription, ThingSession};
use crate::transport::{InboundMessage, MqttError};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Reconciliation callback: receives the requested state, returns what to report
///
/// Returning `None` or an empty map reports nothing.
pub type DeltaCallback = Box<dyn FnMut(&StateMap) -> Option<StateMap> + Send>;

type CallbackSlot = Arc<Mutex<Option<DeltaCallback>>>;

struct DeltaListener {
    subscription: Subscription,
    worker: JoinHandle<()>,
}

/// Shadow synchronizer for one thing
pub struct Shadow {
    session: Arc<ThingSession>,
    callback: CallbackSlot,
    listener: tokio::sync::Mutex<Option<DeltaListener>>,
}

impl Shadow {
    pub fn new(session: Arc<ThingSession>) -> Self {
        Self {
            session,
            callback: Arc::new(Mutex::new(None)),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    /// Publish `{"state": {"reported": state}}`
    ///
    /// Nothing is awaited and nothing is stored locally.
    pub async fn report(&self, state: &StateMap) -> Result<(), CallError> {
        report(&self.session, state).await
    }

    /// Install the reconciliation callback
    ///
    /// The delta topic is subscribed on the first call only; later calls
    /// replace the callback.
    pub async fn on_delta<F>(&self, callback: F) -> Result<(), MqttError>
    where
        F: FnMut(&StateMap) -> Option<StateMap> + Send + 'static,
    {
        *self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));

        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            debug!(thing = %self.session.thing(), "Replaced shadow delta callback");
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |message: &InboundMessage| {
            if tx.send(message.clone()).is_err() {
                debug!(topic = %message.topic, "Shadow delta worker gone, dropping delta");
            }
        });

        let delta_topic = self.session.topics().shadow_delta();
        let subscription = self
            .session
            .subscribe(delta_topic.clone(), TopicMatch::Exact(delta_topic), handler)
            .await?;

        let span = crate::shadow_span!(thing = %self.session.thing());
        let worker = tokio::spawn(
            run_delta_worker(Arc::clone(&self.session), Arc::clone(&self.callback), rx)
                .instrument(span),
        );
        *listener = Some(DeltaListener {
            subscription,
            worker,
        });
        info!(thing = %self.session.thing(), "Listening for shadow deltas");
        Ok(())
    }

    pub async fn is_listening(&self) -> bool {
        self.listener.lock().await.is_some()
    }

    /// Stop listening for deltas and drop the callback
    pub async fn close(&self) -> Result<(), MqttError> {
        let listener = self.listener.lock().await.take();
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(DeltaListener {
            subscription,
            worker,
        }) = listener
        {
            subscription.release().await?;
            // The channel closes with the route, so the worker finishes on its own
            if let Err(e) = worker.await {
                warn!("Shadow delta worker ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

async fn report(session: &ThingSession, state: &StateMap) -> Result<(), CallError> {
    let topic = session.topics().shadow_update();
    debug!(thing = %session.thing(), keys = state.len(), "Reporting shadow state");
    session
        .publish_json(&topic, &ShadowReport::new(state.clone()))
        .await
}

async fn run_delta_worker(
    session: Arc<ThingSession>,
    callback: CallbackSlot,
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
) {
    while let Some(message) = rx.recv().await {
        let delta: DeltaDocument = match serde_json::from_slice(&message.payload) {
            Ok(delta) => delta,
            Err(e) => {
                warn!(topic = %message.topic, "Ignoring malformed shadow delta: {}", e);
                continue;
            }
        };
        debug!(version = ?delta.version, keys = delta.state.len(), "Shadow delta received");

        let reported = {
            let mut slot = callback.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_mut() {
                Some(callback) => callback(&delta.state),
                None => None,
            }
        };

        match reported {
            Some(state) if !state.is_empty() => {
                if let Err(e) = report(&session, &state).await {
                    warn!("Failed to report reconciled shadow state: {}", e);
                }
            }
            _ => debug!("Delta callback reported nothing"),
        }
    }
    debug!("Shadow delta worker stopped");
}
