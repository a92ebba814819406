//! Heart-beat negotiation.
//!
//! A client's `heart-beat:cx,cy` header says it can send every `cx` ms and
//! wants to receive every `cy` ms; `0` means never. The server offers the
//! same interval in both directions. Each direction uses the larger of the
//! two intervals, or none when either side declines.

use std::time::Duration;

use crate::transport::frame::FrameError;

/// Negotiated heart-beat intervals for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    /// How often the server sends a heart-beat.
    pub outgoing: Option<Duration>,
    /// How often the client promised to send something.
    pub incoming: Option<Duration>,
}

impl Heartbeat {
    pub fn negotiate(client: (u64, u64), server_ms: u64) -> Self {
        let (client_send, client_receive) = client;
        Self {
            outgoing: interval(server_ms, client_receive),
            incoming: interval(client_send, server_ms),
        }
    }

    /// Silence longer than this ends the session.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.incoming.map(|d| d * 2)
    }
}

fn interval(a: u64, b: u64) -> Option<Duration> {
    if a == 0 || b == 0 {
        None
    } else {
        Some(Duration::from_millis(a.max(b)))
    }
}

/// Parses a `heart-beat` header value. A missing header means `0,0`.
pub fn parse_header(value: Option<&str>) -> Result<(u64, u64), FrameError> {
    let Some(value) = value else {
        return Ok((0, 0));
    };
    let invalid = || FrameError::MalformedHeader(format!("heart-beat:{value}"));
    let (send, receive) = value.split_once(',').ok_or_else(invalid)?;
    let send = send.trim().parse().map_err(|_| invalid())?;
    let receive = receive.trim().parse().map_err(|_| invalid())?;
    Ok((send, receive))
}
