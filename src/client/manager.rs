//! Connection manager
//!
//! The manager is the entry point for every client-facing operation: it
//! opens and authenticates connections, attaches subscriptions to the
//! router on their behalf and tears everything down again on disconnect.
//! It is shared as `Arc<ConnectionManager>` and constructed once at startup;
//! `shutdown` disconnects whatever is still open.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::broker::{
    DeliveryMode, DeliveryReceipt, Destination, Envelope, Handler, Headers, ReplyCorrelator,
    Router, SubscriptionId,
};
use crate::client::auth::{Authenticator, Credentials};
use crate::client::connection::{Connection, ConnectionHandle, ConnectionState};
use crate::config::{BrokerSettings, Settings};
use crate::utils::{self, BrokerError, Result};

#[derive(Debug)]
pub struct ConnectionManager {
    router: Arc<Router>,
    authenticator: Authenticator,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    max_connections: usize,
    outbound_buffer: usize,
}

impl ConnectionManager {
    pub fn new(router: Arc<Router>, authenticator: Authenticator, broker: &BrokerSettings) -> Self {
        Self {
            router,
            authenticator,
            connections: RwLock::new(HashMap::new()),
            max_connections: broker.max_connections,
            outbound_buffer: broker.outbound_buffer,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Arc::new(Router::from_settings(&settings.broker)),
            Authenticator::from_settings(&settings.auth),
            &settings.broker,
        )
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn correlator(&self) -> ReplyCorrelator {
        ReplyCorrelator::new(self.router.clone())
    }

    pub fn connection_count(&self) -> usize {
        utils::read(&self.connections).len()
    }

    pub fn get(&self, id: &str) -> Option<ConnectionHandle> {
        utils::read(&self.connections).get(id).cloned()
    }

    /// Creates an unauthenticated connection.
    pub fn open(&self) -> Result<ConnectionHandle> {
        let mut connections = utils::write(&self.connections);
        if connections.len() >= self.max_connections {
            warn!(limit = self.max_connections, "connection limit reached");
            return Err(BrokerError::ConnectionLimit(self.max_connections));
        }
        let connection = Arc::new(Connection::new(self.outbound_buffer));
        connections.insert(connection.id().to_string(), connection.clone());
        debug!(connection = connection.id(), "connection opened");
        Ok(connection)
    }

    /// Authenticates an open connection. Bad credentials disconnect it.
    pub fn authenticate(&self, connection: &Connection, credentials: &Credentials) -> Result<()> {
        match connection.state() {
            ConnectionState::Authenticated => return Ok(()),
            ConnectionState::Disconnected => {
                return Err(BrokerError::Disconnected(connection.id().to_string()));
            }
            ConnectionState::Unauthenticated => {}
        }

        match self.authenticator.authenticate(credentials) {
            Ok(principal) => {
                info!(connection = connection.id(), principal = %principal, "authenticated");
                connection.set_authenticated(principal);
                Ok(())
            }
            Err(e) => {
                warn!(connection = connection.id(), login = credentials.login(), "authentication failed");
                self.disconnect(connection);
                Err(e)
            }
        }
    }

    /// Opens and authenticates a connection in one step.
    pub fn connect(&self, credentials: &Credentials) -> Result<ConnectionHandle> {
        let connection = self.open()?;
        self.authenticate(&connection, credentials)?;
        Ok(connection)
    }

    /// Subscribes `connection` to `destination`. A bare name takes its
    /// namespace from `mode`; a namespaced destination must match it.
    pub fn subscribe(
        &self,
        connection: &Connection,
        destination: &str,
        mode: DeliveryMode,
    ) -> Result<SubscriptionId> {
        self.attach(connection, destination, mode, None)
    }

    /// Subscribes and registers `handler` for the new subscription. The
    /// connection's dispatcher must be running for the handler to be called.
    pub fn subscribe_handler(
        &self,
        connection: &Connection,
        destination: &str,
        mode: DeliveryMode,
        handler: Arc<dyn Handler>,
    ) -> Result<SubscriptionId> {
        self.attach(connection, destination, mode, Some(handler))
    }

    fn attach(
        &self,
        connection: &Connection,
        destination: &str,
        mode: DeliveryMode,
        handler: Option<Arc<dyn Handler>>,
    ) -> Result<SubscriptionId> {
        ensure_authenticated(connection)?;
        let parsed = Destination::resolve(destination, mode)?;
        let outbox = connection
            .outbox()
            .ok_or_else(|| BrokerError::Disconnected(connection.id().to_string()))?;

        // the handler must be in place before the first delivery can arrive
        let mut handlers = connection.handlers_mut();
        let id = self.router.subscribe(connection.id(), parsed, outbox);
        if let Some(handler) = handler {
            handlers.insert(id, handler);
        }
        drop(handlers);
        connection.add_subscription(id);

        // a concurrent disconnect may have swept the router before we got in
        if connection.state() == ConnectionState::Disconnected {
            self.router.unsubscribe(id);
            connection.remove_subscription(id);
            return Err(BrokerError::Disconnected(connection.id().to_string()));
        }

        info!(connection = connection.id(), subscription = %id, destination, "subscribed");
        Ok(id)
    }

    /// Removes one of the connection's subscriptions. Unknown ids, including
    /// ones already removed, are ignored.
    pub fn unsubscribe(&self, connection: &Connection, id: SubscriptionId) {
        if !connection.remove_subscription(id) {
            debug!(connection = connection.id(), subscription = %id, "unknown subscription, ignored");
            return;
        }
        connection.handlers_mut().remove(&id);
        self.router.unsubscribe(id);
        info!(connection = connection.id(), subscription = %id, "unsubscribed");
    }

    /// Publishes a new envelope on behalf of `connection`.
    pub async fn publish(
        &self,
        connection: &Connection,
        destination: &str,
        headers: Headers,
        body: impl Into<Vec<u8>>,
    ) -> Result<DeliveryReceipt> {
        ensure_authenticated(connection)?;
        let destination = Destination::parse(destination)?;
        let receipt = self
            .router
            .publish(Envelope::new(destination, headers, body))
            .await?;
        debug!(
            connection = connection.id(),
            destination = %receipt.destination,
            message_id = %receipt.message_id,
            delivered = receipt.delivered,
            "published"
        );
        Ok(receipt)
    }

    /// Publishes a response to `request`'s `reply-to` destination.
    pub async fn reply(
        &self,
        connection: &Connection,
        request: &Envelope,
        body: impl Into<Vec<u8>>,
        headers: Headers,
    ) -> Result<DeliveryReceipt> {
        ensure_authenticated(connection)?;
        self.correlator().reply(request, body, headers).await
    }

    /// Releases every subscription of `connection` and discards its outbound
    /// buffer. Calling it again is harmless.
    pub fn disconnect(&self, connection: &Connection) {
        let was_open = connection.mark_disconnected();
        let removed = self.router.remove_connection(connection.id());
        connection.release();
        utils::write(&self.connections).remove(connection.id());

        if was_open {
            info!(
                connection = connection.id(),
                subscriptions = removed.len(),
                "disconnected"
            );
        }
    }

    /// Disconnects every open connection.
    pub fn shutdown(&self) {
        let open: Vec<ConnectionHandle> = utils::read(&self.connections).values().cloned().collect();
        for connection in open {
            self.disconnect(&connection);
        }
        info!("connection manager shut down");
    }
}

fn ensure_authenticated(connection: &Connection) -> Result<()> {
    match connection.state() {
        ConnectionState::Authenticated => Ok(()),
        ConnectionState::Unauthenticated => {
            Err(BrokerError::NotAuthenticated(connection.id().to_string()))
        }
        ConnectionState::Disconnected => Err(BrokerError::Disconnected(connection.id().to_string())),
    }
}
