//! STOMP client
//!
//! A small STOMP 1.2 over WebSocket client used by the demo publisher, the
//! RPC responder and the end-to-end tests. Subscribing and unsubscribing
//! wait for the server's RECEIPT, so a subscription is live when
//! `subscribe` returns. Frames that arrive while waiting are kept and handed
//! out by `next_frame`.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Headers;
use crate::transport::frame::{Command, Frame, FrameError, Version};
use crate::transport::websocket::to_ws;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("bad frame from server: {0}")]
    Frame(#[from] FrameError),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected {0} frame")]
    Unexpected(Command),
    #[error("connection closed")]
    Closed,
}

pub struct StompClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Frame>,
    next_id: u64,
    session: Option<String>,
}

impl StompClient {
    /// Connects and authenticates with a login and passcode.
    pub async fn connect(url: &str, login: &str, passcode: &str) -> Result<Self, ClientError> {
        Self::open(url, Some(login), passcode).await
    }

    /// Connects and authenticates with a bearer token.
    pub async fn connect_with_token(url: &str, token: &str) -> Result<Self, ClientError> {
        Self::open(url, None, token).await
    }

    async fn open(url: &str, login: Option<&str>, passcode: &str) -> Result<Self, ClientError> {
        let parsed = url::Url::parse(url)?;
        let host = parsed.host_str().unwrap_or("localhost").to_string();
        let (stream, _) = connect_async(url).await?;

        let mut client = Self {
            stream,
            pending: VecDeque::new(),
            next_id: 0,
            session: None,
        };

        let mut connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", "0,0");
        if let Some(login) = login {
            connect = connect.header("login", login);
        }
        client.write(connect.header("passcode", passcode)).await?;

        let reply = client.read().await?;
        match reply.command {
            Command::Connected => {
                client.session = reply.get("session").map(str::to_owned);
                debug!(url, session = ?client.session, "connected");
                Ok(client)
            }
            Command::Error => Err(server_error(&reply)),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Session id assigned by the broker.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Subscribes to `destination` and returns the subscription id.
    pub async fn subscribe(&mut self, destination: &str) -> Result<String, ClientError> {
        let id = self.fresh_id("sub");
        let receipt = self.fresh_id("receipt");
        self.write(
            Frame::new(Command::Subscribe)
                .header("id", id.as_str())
                .header("destination", destination)
                .header("ack", "auto")
                .header("receipt", receipt.as_str()),
        )
        .await?;
        self.await_receipt(&receipt).await?;
        Ok(id)
    }

    pub async fn unsubscribe(&mut self, id: &str) -> Result<(), ClientError> {
        let receipt = self.fresh_id("receipt");
        self.write(
            Frame::new(Command::Unsubscribe)
                .header("id", id)
                .header("receipt", receipt.as_str()),
        )
        .await?;
        self.await_receipt(&receipt).await
    }

    /// Sends a message without waiting for the broker.
    pub async fn send(
        &mut self,
        destination: &str,
        headers: &Headers,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), ClientError> {
        self.write(send_frame(destination, headers, body)).await
    }

    /// Sends a message and waits until the broker has routed it.
    pub async fn send_confirmed(
        &mut self,
        destination: &str,
        headers: &Headers,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), ClientError> {
        let receipt = self.fresh_id("receipt");
        self.write(send_frame(destination, headers, body).header("receipt", receipt.as_str()))
            .await?;
        self.await_receipt(&receipt).await
    }

    /// Next frame from the server, buffered ones first.
    pub async fn next_frame(&mut self) -> Result<Frame, ClientError> {
        match self.pending.pop_front() {
            Some(frame) => Ok(frame),
            None => self.read().await,
        }
    }

    /// Next MESSAGE frame. An ERROR frame is returned as `ClientError::Server`.
    pub async fn next_message(&mut self) -> Result<Frame, ClientError> {
        loop {
            let frame = self.next_frame().await?;
            match frame.command {
                Command::Message => return Ok(frame),
                Command::Error => return Err(server_error(&frame)),
                _ => continue,
            }
        }
    }

    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        let receipt = self.fresh_id("receipt");
        self.write(Frame::new(Command::Disconnect).header("receipt", receipt.as_str()))
            .await?;
        let confirmed = self.await_receipt(&receipt).await;
        let _ = self.stream.close(None).await;
        match confirmed {
            Ok(()) | Err(ClientError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn await_receipt(&mut self, receipt: &str) -> Result<(), ClientError> {
        loop {
            let frame = self.read().await?;
            match frame.command {
                Command::Receipt if frame.get("receipt-id") == Some(receipt) => return Ok(()),
                Command::Error => return Err(server_error(&frame)),
                _ => self.pending.push_back(frame),
            }
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<(), ClientError> {
        self.stream.send(to_ws(&frame, Version::V1_2)).await?;
        Ok(())
    }

    /// Reads one frame off the socket, skipping heart-beats.
    async fn read(&mut self) -> Result<Frame, ClientError> {
        loop {
            let parsed = match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => Frame::parse(text.as_bytes())?,
                Some(Ok(WsMessage::Binary(data))) => Frame::parse(&data)?,
                Some(Ok(WsMessage::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => None,
                Some(Err(e)) => return Err(e.into()),
            };
            if let Some(frame) = parsed {
                return Ok(frame);
            }
        }
    }

    fn fresh_id(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}-{}", self.next_id);
        self.next_id += 1;
        id
    }
}

fn send_frame(destination: &str, headers: &Headers, body: impl Into<Vec<u8>>) -> Frame {
    Frame::new(Command::Send)
        .header("destination", destination)
        .headers_from(headers)
        .body(body)
}

fn server_error(frame: &Frame) -> ClientError {
    let message = frame
        .get("message")
        .map(str::to_owned)
        .unwrap_or_else(|| frame.body_text());
    ClientError::Server(message)
}
