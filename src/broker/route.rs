//! Route table entries
//!
//! A `Route` holds the subscription ids attached to one destination, in
//! subscription order, plus the round-robin cursor used for queues.
//! Duplicate subscriptions are a no-op.
//!
//! Concurrency note: routes live inside the router's table lock. The cursor
//! is atomic so queue publishes can advance it under the read lock.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc::WeakSender;

use crate::broker::destination::Destination;
use crate::broker::envelope::Delivery;

/// Connection identifiers, e.g. `conn-6f1c...`.
pub type ConnectionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A connection's interest in a destination.
///
/// The outbox is weak: the connection owns the only strong sender, so a
/// dropped connection can never be delivered to.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub connection: ConnectionId,
    pub destination: Destination,
    pub outbox: WeakSender<Delivery>,
}

#[derive(Debug, Default)]
pub struct Route {
    pub subscribers: Vec<SubscriptionId>,
    cursor: AtomicUsize,
}

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription to the route. Duplicate adds are ignored.
    pub fn subscribe(&mut self, id: SubscriptionId) {
        if !self.subscribers.contains(&id) {
            self.subscribers.push(id);
        }
    }

    /// Remove a subscription from the route. Returns whether it was present.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.subscribers.iter().position(|s| *s == id) {
            Some(idx) => {
                self.subscribers.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Subscribers in round-robin order for the next queue delivery, and
    /// advances the cursor by one.
    pub fn rotation(&self) -> Vec<SubscriptionId> {
        let len = self.subscribers.len();
        if len == 0 {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        self.subscribers[start..]
            .iter()
            .chain(&self.subscribers[..start])
            .copied()
            .collect()
    }
}
