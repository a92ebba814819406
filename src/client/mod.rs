//! The `client` module covers everything on the client side of the broker.
//!
//! It provides the `Connection` a client holds while attached, the
//! `ConnectionManager` that authenticates connections and drives their
//! subscriptions, and a `StompClient` for talking to the broker over
//! WebSocket.

pub mod auth;
pub mod connection;
pub mod manager;
pub mod stomp_client;

pub use auth::{Authenticator, Credentials};
pub use connection::{Connection, ConnectionHandle, ConnectionState};
pub use manager::ConnectionManager;
pub use stomp_client::{ClientError, StompClient};
