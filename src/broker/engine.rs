//! Broker engine
//!
//! This module contains the in-memory router responsible for:
//! - mapping destinations to their subscriptions
//! - fanning topic messages out to every subscriber
//! - handing queue messages to one subscriber, round-robin
//! - applying the backpressure policy when an outbound buffer is full
//!
//! Concurrency and usage notes:
//! - The router is internally synchronized and shared as `Arc<Router>`.
//!   The route table sits behind a single `RwLock`: subscribe, unsubscribe
//!   and connection removal take the write lock, publish takes the read lock
//!   only long enough to pick its targets.
//! - No lock is held across an await. A delivery that races with an
//!   unsubscribe may still land in the connection's buffer; the connection's
//!   dispatcher discards deliveries for subscriptions it no longer holds.
//! - Messages are delivered at most once. Nothing is persisted: a queue
//!   message published while the queue has no subscriber is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, OwnedPermit, WeakSender};
use tracing::{debug, info, trace, warn};

use crate::broker::destination::{DeliveryMode, Destination};
use crate::broker::envelope::{Delivery, Envelope, Headers};
use crate::broker::route::{ConnectionId, Route, Subscription, SubscriptionId};
use crate::config::{BackpressureMode, BrokerSettings};
use crate::utils::{self, BrokerError, Result};

/// What `publish` does when a recipient's outbound buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Fail the publish with `BrokerError::Backpressure`.
    Fail,
    /// Wait up to the given duration for space, then fail.
    Block(Duration),
}

impl From<&BrokerSettings> for BackpressurePolicy {
    fn from(settings: &BrokerSettings) -> Self {
        match settings.backpressure {
            BackpressureMode::Fail => BackpressurePolicy::Fail,
            BackpressureMode::Block => {
                BackpressurePolicy::Block(Duration::from_millis(settings.block_timeout_ms))
            }
        }
    }
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub destination: Destination,
    /// Number of subscriptions the envelope was enqueued for.
    pub delivered: usize,
}

#[derive(Debug, Default)]
struct RouteTable {
    routes: HashMap<Destination, Route>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl RouteTable {
    fn detach(&mut self, id: SubscriptionId) -> Option<Subscription> {
        let subscription = self.subscriptions.remove(&id)?;
        if let Some(route) = self.routes.get_mut(&subscription.destination) {
            route.unsubscribe(id);
            if route.is_empty() {
                self.routes.remove(&subscription.destination);
            }
        }
        Some(subscription)
    }
}

/// A subscription resolved for one publish.
struct Target {
    subscription: SubscriptionId,
    connection: ConnectionId,
    outbox: mpsc::Sender<Delivery>,
}

impl Target {
    fn backpressure(&self) -> BrokerError {
        BrokerError::Backpressure {
            connection: self.connection.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Router {
    table: RwLock<RouteTable>,
    next_subscription: AtomicU64,
    policy: BackpressurePolicy,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(BackpressurePolicy::Fail)
    }
}

impl Router {
    pub fn new(policy: BackpressurePolicy) -> Self {
        Self {
            table: RwLock::new(RouteTable::default()),
            next_subscription: AtomicU64::new(1),
            policy,
        }
    }

    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new(BackpressurePolicy::from(settings))
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Registers `connection`'s interest in `destination`. Deliveries are
    /// pushed into `outbox`.
    pub fn subscribe(
        &self,
        connection: &str,
        destination: Destination,
        outbox: WeakSender<Delivery>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut table = utils::write(&self.table);
        table
            .routes
            .entry(destination.clone())
            .or_insert_with(Route::new)
            .subscribe(id);
        debug!(subscription = %id, connection, destination = %destination, "route added");
        table.subscriptions.insert(
            id,
            Subscription {
                id,
                connection: connection.to_string(),
                destination,
                outbox,
            },
        );
        id
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = utils::write(&self.table).detach(id);
        match removed {
            Some(subscription) => {
                debug!(subscription = %id, destination = %subscription.destination, "route removed");
                true
            }
            None => false,
        }
    }

    /// Removes every subscription owned by `connection` in one step and
    /// returns their ids.
    pub fn remove_connection(&self, connection: &str) -> Vec<SubscriptionId> {
        let mut table = utils::write(&self.table);
        let mut ids: Vec<SubscriptionId> = table
            .subscriptions
            .values()
            .filter(|s| s.connection == connection)
            .map(|s| s.id)
            .collect();
        ids.sort();
        for id in &ids {
            table.detach(*id);
        }
        ids
    }

    /// Connections subscribed to `destination`, in subscription order.
    pub fn subscribers(&self, destination: &Destination) -> Vec<ConnectionId> {
        let table = utils::read(&self.table);
        table
            .routes
            .get(destination)
            .map(|route| {
                route
                    .subscribers
                    .iter()
                    .filter_map(|id| table.subscriptions.get(id))
                    .map(|s| s.connection.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        utils::read(&self.table).subscriptions.len()
    }

    pub fn destination_of(&self, id: SubscriptionId) -> Option<Destination> {
        utils::read(&self.table)
            .subscriptions
            .get(&id)
            .map(|s| s.destination.clone())
    }

    /// Parses `destination` and publishes a new envelope to it.
    pub async fn publish_to(
        &self,
        destination: &str,
        headers: Headers,
        body: impl Into<Vec<u8>>,
    ) -> Result<DeliveryReceipt> {
        let destination = Destination::parse(destination)?;
        self.publish(Envelope::new(destination, headers, body)).await
    }

    /// Publishes `envelope` to its destination.
    ///
    /// Topics deliver to every current subscriber, queues to exactly one.
    /// Publishing to a destination without subscribers is not an error; the
    /// receipt reports zero deliveries.
    pub async fn publish(&self, envelope: Envelope) -> Result<DeliveryReceipt> {
        let envelope = Arc::new(envelope);
        let destination = envelope.destination().clone();
        let targets = self.targets(&destination);

        let delivered = if targets.is_empty() {
            info!(
                destination = %destination,
                message_id = envelope.message_id(),
                "no subscribers, message dropped"
            );
            0
        } else {
            match destination.mode() {
                DeliveryMode::Topic => self.fan_out(&targets, &envelope).await?,
                DeliveryMode::Queue => self.deliver_one(&targets, &envelope).await?,
            }
        };

        Ok(DeliveryReceipt {
            message_id: envelope.message_id().to_string(),
            destination,
            delivered,
        })
    }

    fn targets(&self, destination: &Destination) -> Vec<Target> {
        let table = utils::read(&self.table);
        let Some(route) = table.routes.get(destination) else {
            return Vec::new();
        };
        let ids = match destination.mode() {
            DeliveryMode::Topic => route.subscribers.clone(),
            DeliveryMode::Queue => route.rotation(),
        };
        ids.iter()
            .filter_map(|id| table.subscriptions.get(id))
            .filter_map(|s| {
                Some(Target {
                    subscription: s.id,
                    connection: s.connection.clone(),
                    outbox: s.outbox.upgrade()?,
                })
            })
            .collect()
    }

    /// Reserves a slot in every target's buffer before sending anything, so
    /// a backpressured topic publish reaches nobody.
    async fn fan_out(&self, targets: &[Target], envelope: &Arc<Envelope>) -> Result<usize> {
        let mut reserved = Vec::with_capacity(targets.len());
        for target in targets {
            if let Some(permit) = self.reserve(target).await? {
                reserved.push((target, permit));
            }
        }

        let delivered = reserved.len();
        for (target, permit) in reserved {
            permit.send(Delivery {
                subscription: target.subscription,
                envelope: Arc::clone(envelope),
            });
            trace!(subscription = %target.subscription, connection = %target.connection, "delivered");
        }
        Ok(delivered)
    }

    /// Delivers to the first target, in round-robin order, with buffer space.
    async fn deliver_one(&self, targets: &[Target], envelope: &Arc<Envelope>) -> Result<usize> {
        let mut congested = None;
        for target in targets {
            match target.outbox.clone().try_reserve_owned() {
                Ok(permit) => {
                    return Ok(Self::send(target, permit, envelope));
                }
                Err(TrySendError::Full(_)) => {
                    congested.get_or_insert(target);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        let Some(target) = congested else {
            info!(destination = %envelope.destination(), "queue subscribers gone, message dropped");
            return Ok(0);
        };
        match self.reserve(target).await? {
            Some(permit) => Ok(Self::send(target, permit, envelope)),
            None => Ok(0),
        }
    }

    fn send(target: &Target, permit: OwnedPermit<Delivery>, envelope: &Arc<Envelope>) -> usize {
        permit.send(Delivery {
            subscription: target.subscription,
            envelope: Arc::clone(envelope),
        });
        trace!(subscription = %target.subscription, connection = %target.connection, "delivered");
        1
    }

    /// Reserves one buffer slot according to the policy. `Ok(None)` means
    /// the connection went away in the meantime.
    async fn reserve(&self, target: &Target) -> Result<Option<OwnedPermit<Delivery>>> {
        match target.outbox.clone().try_reserve_owned() {
            Ok(permit) => return Ok(Some(permit)),
            Err(TrySendError::Closed(_)) => return Ok(None),
            Err(TrySendError::Full(_)) => {}
        }

        match self.policy {
            BackpressurePolicy::Fail => {
                warn!(connection = %target.connection, "outbound buffer full");
                Err(target.backpressure())
            }
            BackpressurePolicy::Block(timeout) => {
                match tokio::time::timeout(timeout, target.outbox.clone().reserve_owned()).await {
                    Ok(Ok(permit)) => Ok(Some(permit)),
                    Ok(Err(_)) => Ok(None),
                    Err(_) => {
                        warn!(
                            connection = %target.connection,
                            timeout_ms = timeout.as_millis() as u64,
                            "outbound buffer still full after waiting"
                        );
                        Err(target.backpressure())
                    }
                }
            }
        }
    }
}
