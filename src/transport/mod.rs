//! The `transport` module carries the broker over the network.
//!
//! It implements the STOMP frame codec (versions 1.0 to 1.2), heart-beat
//! negotiation and the WebSocket server that turns STOMP sessions into
//! connection manager calls.

pub mod frame;
pub mod heartbeat;
pub mod websocket;

pub use frame::{Command, Frame, FrameError, Version};
pub use websocket::{bind, serve, start_websocket_server};
