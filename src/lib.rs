//! # stompcooler
//!
//! `stompcooler` is a minimal, in-memory publish/subscribe broker that
//! speaks STOMP 1.0 to 1.2 over WebSockets. Browsers subscribe to topics and
//! queues and receive HTML fragments, scripts and events pushed by
//! backend publishers; request/reply works by naming a response
//! destination in the `reply-to` header.
//!
//! ## Core Modules
//!
//! - `broker`: destinations, envelopes, the topic/queue router and the reply correlator.
//! - `client`: connections, the connection manager, authentication and a STOMP client.
//! - `config`: loading settings from files and the environment.
//! - `demo`: the fragment demo publisher and the upper-case RPC responder.
//! - `transport`: the STOMP frame codec and the WebSocket server.
//! - `utils`: error types, logging setup and lock helpers.

pub mod broker;
pub mod client;
pub mod config;
pub mod demo;
pub mod transport;
pub mod utils;
