//! Message envelopes
//!
//! `Envelope` is the unit of transport between publishers and subscribers.
//! It is immutable once built and shared between recipients behind an `Arc`.
//!
//! Notes on fields:
//! - `message_id`: opaque unique id assigned at construction
//! - `destination`: where the envelope was published
//! - `headers`: ordered, unique-key metadata, opaque to the broker
//! - `body`: raw bytes; HTML fragments and form data in practice
//! - `timestamp`: milliseconds since UNIX epoch at construction

use std::borrow::Cow;
use std::sync::Arc;

use uuid::Uuid;

use crate::broker::destination::Destination;
use crate::broker::route::SubscriptionId;

/// Header naming the destination a response should be published to.
pub const REPLY_TO: &str = "reply-to";

/// Ordered string map with unique keys.
///
/// Insertion order is preserved; inserting an existing key replaces the
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    /// Builder-style `insert`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    message_id: String,
    destination: Destination,
    headers: Headers,
    body: Vec<u8>,
    timestamp: i64,
}

impl Envelope {
    pub fn new(destination: Destination, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            destination,
            headers,
            body: body.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.header(REPLY_TO)
    }
}

/// An envelope queued for one subscription of a connection.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub envelope: Arc<Envelope>,
}
