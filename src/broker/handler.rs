//! Delivery handlers
//!
//! In-process consumers attached to a subscription with
//! `ConnectionManager::subscribe_handler`.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::broker::envelope::Envelope;

/// Consumer of delivered envelopes.
///
/// A connection's dispatcher calls `handle` for each delivery on the
/// subscription the handler was registered for, one at a time and in
/// delivery order. Any `Fn(Arc<Envelope>) -> impl Future<Output = ()>`
/// closure is a handler.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, ()> {
        Box::pin(self(envelope))
    }
}
