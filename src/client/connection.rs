//! Connection representation
//!
//! `Connection` models one client session with the broker. It owns the
//! strong side of its bounded outbound buffer; the router only keeps weak
//! senders, so once the connection closes its buffer nothing can be
//! delivered to it. The connection also records which subscriptions it
//! holds and which handlers consume them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use tokio::sync::mpsc::{self, Receiver, Sender, WeakSender};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{ConnectionId, Delivery, Handler, SubscriptionId};
use crate::utils;

/// `Unauthenticated -> Authenticated -> Disconnected`. Only `Authenticated`
/// permits subscribe and publish; `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Disconnected,
}

pub type ConnectionHandle = Arc<Connection>;

pub(crate) type HandlerTable = HashMap<SubscriptionId, Arc<dyn Handler>>;

pub struct Connection {
    id: ConnectionId,
    state: Mutex<ConnectionState>,
    principal: Mutex<Option<String>>,
    subscriptions: Mutex<HashSet<SubscriptionId>>,
    outbox: Mutex<Option<Sender<Delivery>>>,
    inbox: Mutex<Option<Receiver<Delivery>>>,
    handlers: RwLock<HandlerTable>,
}

impl Connection {
    /// Create an unauthenticated connection whose outbound buffer holds
    /// `buffer` deliveries.
    pub(crate) fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Self {
            id: format!("conn-{}", Uuid::new_v4()),
            state: Mutex::new(ConnectionState::Unauthenticated),
            principal: Mutex::new(None),
            subscriptions: Mutex::new(HashSet::new()),
            outbox: Mutex::new(Some(tx)),
            inbox: Mutex::new(Some(rx)),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *utils::lock(&self.state)
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// The login this connection authenticated as.
    pub fn principal(&self) -> Option<String> {
        utils::lock(&self.principal).clone()
    }

    /// Subscription ids currently held, in ascending order.
    pub fn subscriptions(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = utils::lock(&self.subscriptions).iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn has_subscription(&self, id: SubscriptionId) -> bool {
        utils::lock(&self.subscriptions).contains(&id)
    }

    /// Takes the receiving side of the outbound buffer. Only the first call
    /// gets it; a transport that writes deliveries itself uses this instead
    /// of `spawn_dispatcher`.
    pub fn take_inbox(&self) -> Option<Receiver<Delivery>> {
        utils::lock(&self.inbox).take()
    }

    /// Starts the connection's dispatcher task, which hands each delivery to
    /// the handler registered for its subscription, in order. Returns `None`
    /// if the inbox was already taken.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut inbox = self.take_inbox()?;
        let connection = Arc::clone(self);

        Some(tokio::spawn(async move {
            while let Some(delivery) = inbox.recv().await {
                if connection.state() == ConnectionState::Disconnected {
                    break;
                }
                let handler = utils::read(&connection.handlers)
                    .get(&delivery.subscription)
                    .cloned();
                match handler {
                    Some(handler) => handler.handle(delivery.envelope).await,
                    None => debug!(
                        connection = %connection.id,
                        subscription = %delivery.subscription,
                        "no handler, delivery discarded"
                    ),
                }
            }
            debug!(connection = %connection.id, "dispatcher stopped");
        }))
    }

    pub(crate) fn outbox(&self) -> Option<WeakSender<Delivery>> {
        utils::lock(&self.outbox).as_ref().map(Sender::downgrade)
    }

    pub(crate) fn set_authenticated(&self, principal: String) {
        *utils::lock(&self.principal) = Some(principal);
        *utils::lock(&self.state) = ConnectionState::Authenticated;
    }

    /// Moves to `Disconnected`. Returns `false` if it already was.
    pub(crate) fn mark_disconnected(&self) -> bool {
        let mut state = utils::lock(&self.state);
        let was_open = *state != ConnectionState::Disconnected;
        *state = ConnectionState::Disconnected;
        was_open
    }

    pub(crate) fn add_subscription(&self, id: SubscriptionId) {
        utils::lock(&self.subscriptions).insert(id);
    }

    pub(crate) fn remove_subscription(&self, id: SubscriptionId) -> bool {
        utils::lock(&self.subscriptions).remove(&id)
    }

    pub(crate) fn handlers_mut(&self) -> RwLockWriteGuard<'_, HandlerTable> {
        utils::write(&self.handlers)
    }

    /// Drops subscriptions, handlers and the outbound sender. Buffered
    /// deliveries are discarded by the dispatcher.
    pub(crate) fn release(&self) {
        utils::lock(&self.subscriptions).clear();
        utils::write(&self.handlers).clear();
        utils::lock(&self.outbox).take();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}
