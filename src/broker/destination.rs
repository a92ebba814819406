//! Destination names
//!
//! A destination is a namespaced name. The namespace decides the delivery
//! semantics: `/topic/...` fans out to every subscriber, `/queue/...` hands
//! each message to exactly one subscriber. Both the STOMP path form
//! (`/topic/demo`) and the short form (`topic:demo`) are accepted; the path
//! form is canonical.

use std::fmt;
use std::str::FromStr;

use crate::utils::{BrokerError, Result};

/// Delivery mode implied by a destination's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Broadcast to every current subscriber.
    Topic,
    /// Single delivery, round-robin across subscribers.
    Queue,
}

impl DeliveryMode {
    fn namespace(self) -> &'static str {
        match self {
            DeliveryMode::Topic => "topic",
            DeliveryMode::Queue => "queue",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    mode: DeliveryMode,
    name: String,
}

impl Destination {
    pub fn topic(name: &str) -> Result<Self> {
        Self::new(DeliveryMode::Topic, name)
    }

    pub fn queue(name: &str) -> Result<Self> {
        Self::new(DeliveryMode::Queue, name)
    }

    fn new(mode: DeliveryMode, name: &str) -> Result<Self> {
        validate_name(mode, name)?;
        Ok(Self {
            mode,
            name: name.to_string(),
        })
    }

    /// Parses any accepted spelling of a destination.
    pub fn parse(raw: &str) -> Result<Self> {
        let (mode, name) = split_namespace(raw)
            .ok_or_else(|| BrokerError::invalid_destination(raw, "unknown namespace"))?;
        if name.is_empty() {
            return Err(BrokerError::invalid_destination(raw, "empty name"));
        }
        if let Some(bad) = name.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(BrokerError::invalid_destination(
                raw,
                format!("illegal character {bad:?}"),
            ));
        }
        Ok(Self {
            mode,
            name: name.to_string(),
        })
    }

    /// Resolves a subscription target. A bare name (`demo`) takes its
    /// namespace from `mode`; a namespaced one must agree with it.
    pub fn resolve(raw: &str, mode: DeliveryMode) -> Result<Self> {
        if split_namespace(raw).is_none() && !raw.starts_with('/') && !raw.contains(':') {
            return Self::new(mode, raw).map_err(|_| {
                BrokerError::invalid_destination(raw, "illegal destination name")
            });
        }
        let parsed = Self::parse(raw)?;
        if parsed.mode != mode {
            return Err(BrokerError::invalid_destination(
                raw,
                format!("not a {mode} destination"),
            ));
        }
        Ok(parsed)
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_topic(&self) -> bool {
        self.mode == DeliveryMode::Topic
    }
}

fn split_namespace(raw: &str) -> Option<(DeliveryMode, &str)> {
    if let Some(name) = raw.strip_prefix("/topic/") {
        Some((DeliveryMode::Topic, name))
    } else if let Some(name) = raw.strip_prefix("/queue/") {
        Some((DeliveryMode::Queue, name))
    } else if let Some(name) = raw.strip_prefix("topic:") {
        Some((DeliveryMode::Topic, name))
    } else if let Some(name) = raw.strip_prefix("queue:") {
        Some((DeliveryMode::Queue, name))
    } else {
        None
    }
}

fn validate_name(mode: DeliveryMode, name: &str) -> Result<()> {
    let rendered = format!("/{mode}/{name}");
    Destination::parse(&rendered).map(|_| ())
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.mode, self.name)
    }
}

impl FromStr for Destination {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        Destination::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_and_short_forms() {
        let path = Destination::parse("/topic/demo").unwrap();
        let short = Destination::parse("topic:demo").unwrap();
        assert_eq!(path, short);
        assert_eq!(path.mode(), DeliveryMode::Topic);
        assert_eq!(path.name(), "demo");
        assert_eq!(short.to_string(), "/topic/demo");

        let queue: Destination = "queue:rpc-demo".parse().unwrap();
        assert_eq!(queue.mode(), DeliveryMode::Queue);
        assert_eq!(queue.to_string(), "/queue/rpc-demo");
    }

    #[test]
    fn names_may_contain_slashes() {
        let dest = Destination::parse("/queue/D-reply/1").unwrap();
        assert_eq!(dest.name(), "D-reply/1");
    }

    #[test]
    fn rejects_unknown_namespace() {
        let err = Destination::parse("/exchange/amq.topic").unwrap_err();
        assert!(matches!(err, BrokerError::InvalidDestination { .. }));
        assert!(Destination::parse("demo").is_err());
    }

    #[test]
    fn rejects_empty_and_illegal_names() {
        assert!(Destination::parse("/topic/").is_err());
        assert!(Destination::parse("queue:").is_err());
        assert!(Destination::parse("/topic/has space").is_err());
        assert!(Destination::topic("tab\there").is_err());
        assert!(Destination::queue("ok").is_ok());
    }

    #[test]
    fn resolve_takes_namespace_from_mode() {
        let bare = Destination::resolve("demo", DeliveryMode::Topic).unwrap();
        assert_eq!(bare.to_string(), "/topic/demo");
        let queue = Destination::resolve("rpc-demo", DeliveryMode::Queue).unwrap();
        assert_eq!(queue.to_string(), "/queue/rpc-demo");
        assert_eq!(
            Destination::resolve("/queue/rpc-demo", DeliveryMode::Queue).unwrap(),
            queue
        );

        assert!(Destination::resolve("/queue/rpc-demo", DeliveryMode::Topic).is_err());
        assert!(Destination::resolve("/exchange/x", DeliveryMode::Topic).is_err());
        assert!(Destination::resolve("amq:x", DeliveryMode::Queue).is_err());
        assert!(Destination::resolve("two words", DeliveryMode::Topic).is_err());
    }
}
