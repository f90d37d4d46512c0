//! Topic router for the shared connection
//!
//! Holds the live set of (rule, handler) routes. Every inbound message is
//! checked against every route and all matching handlers run, not just the
//! first one. Handlers are collected under a read lock and invoked after it
//! is released, so a handler may register or remove routes without
//! deadlocking and delivery never waits on a caller holding the lock.

use crate::protocol::TopicMatch;
use crate::transport::InboundMessage;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace};

/// Callback invoked on the delivery path; must not block
pub type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Identity of a registered route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route-{}", self.0)
    }
}

struct Route {
    id: RouteId,
    rule: TopicMatch,
    handler: Handler,
}

/// Shared, cheaply clonable routing table
#[derive(Clone, Default)]
pub struct TopicRouter {
    routes: Arc<RwLock<Vec<Route>>>,
    next_id: Arc<AtomicU64>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route; the handler sees every message matching `rule` from now on
    pub fn register(&self, rule: TopicMatch, handler: Handler) -> RouteId {
        let id = RouteId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(target: "router", %id, %rule, "Registering route");

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.push(Route { id, rule, handler });
        id
    }

    /// Remove a route by identity; returns false if it was already gone
    pub fn unregister(&self, id: RouteId) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|route| route.id != id);
        let removed = routes.len() != before;
        debug!(target: "router", %id, removed, "Unregistering route");
        removed
    }

    /// Invoke every handler whose rule matches the message topic
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let matching: Vec<Handler> = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            routes
                .iter()
                .filter(|route| route.rule.matches(&message.topic))
                .map(|route| Arc::clone(&route.handler))
                .collect()
        };

        if matching.is_empty() {
            trace!(target: "router", topic = %message.topic, "No route for message");
        }

        for handler in &matching {
            handler(message);
        }
        matching.len()
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRouter")
            .field("routes", &self.len())
            .finish()
    }
}
