//! Request/reply on top of publish.
//!
//! A request names its response destination in the `reply-to` header.
//! Replying is a plain publish to that destination: nothing tracks pending
//! requests, and there are no timeouts or retries.

use std::sync::Arc;

use tracing::debug;

use crate::broker::destination::Destination;
use crate::broker::engine::{DeliveryReceipt, Router};
use crate::broker::envelope::{Envelope, Headers};
use crate::utils::{BrokerError, Result};

/// Copied from request to reply unless the reply sets its own.
pub const CORRELATION_ID: &str = "correlation-id";

#[derive(Debug, Clone)]
pub struct ReplyCorrelator {
    router: Arc<Router>,
}

impl ReplyCorrelator {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Builds the response to `request` without publishing it.
    pub fn reply_envelope(
        request: &Envelope,
        body: impl Into<Vec<u8>>,
        mut headers: Headers,
    ) -> Result<Envelope> {
        let reply_to = request.reply_to().ok_or(BrokerError::NoReplyDestination)?;
        let destination = Destination::parse(reply_to)?;
        if let Some(correlation_id) = request.header(CORRELATION_ID) {
            if !headers.contains_key(CORRELATION_ID) {
                headers.insert(CORRELATION_ID, correlation_id);
            }
        }
        Ok(Envelope::new(destination, headers, body))
    }

    /// Publishes a response to the request's `reply-to` destination.
    pub async fn reply(
        &self,
        request: &Envelope,
        body: impl Into<Vec<u8>>,
        headers: Headers,
    ) -> Result<DeliveryReceipt> {
        let response = Self::reply_envelope(request, body, headers)?;
        debug!(
            request = request.message_id(),
            reply_to = %response.destination(),
            "replying"
        );
        self.router.publish(response).await
    }
}
