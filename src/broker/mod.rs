//! The broker core: destinations, envelopes, the topic/queue router, the
//! reply correlator and the handler capability.
//!
//! Public types:
//! - `Router`: routes published envelopes to subscriptions.
//! - `Envelope`, `Headers`: the unit of transport.
//! - `ReplyCorrelator`: publishes responses to a request's `reply-to`.
//! - `Handler`: anything that consumes delivered envelopes.
//!
//! Connections and their lifecycle live in the `client` module.

pub mod destination;
pub mod engine;
pub mod envelope;
pub mod handler;
pub mod reply;
pub mod route;

pub use destination::{DeliveryMode, Destination};
pub use engine::{BackpressurePolicy, DeliveryReceipt, Router};
pub use envelope::{Delivery, Envelope, Headers, REPLY_TO};
pub use handler::Handler;
pub use reply::ReplyCorrelator;
pub use route::{ConnectionId, SubscriptionId};

#[cfg(test)]
mod tests;
