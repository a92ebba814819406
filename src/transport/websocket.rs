//! WebSocket transport
//!
//! STOMP over WebSocket. Each accepted socket becomes one connection in
//! the `ConnectionManager`:
//! - the first frame must be CONNECT (or STOMP) carrying credentials and
//!   must arrive within the connect timeout; anything else ends the session
//! - the highest of STOMP 1.2, 1.1 and 1.0 the client accepts is used for
//!   the rest of the session
//! - SEND, SUBSCRIBE and UNSUBSCRIBE map onto manager operations
//! - deliveries are written back as MESSAGE frames by a per-session writer
//!   task, which also emits heart-beats
//!
//! Recoverable broker errors answer with an ERROR frame and the session
//! continues. Protocol and authentication errors answer with an ERROR frame
//! and close the socket.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, Interval};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Delivery, Destination, Envelope, SubscriptionId};
use crate::client::auth::Credentials;
use crate::client::{ConnectionHandle, ConnectionManager};
use crate::config::Settings;
use crate::transport::frame::{Command, Frame, FrameError, Version};
use crate::transport::heartbeat::{self, Heartbeat};
use crate::utils::{self, BrokerError};

type WsStream = WebSocketStream<TcpStream>;

const SERVER_NAME: &str = concat!("stompcooler/", env!("CARGO_PKG_VERSION"));
const SUBPROTOCOLS: [&str; 3] = ["v12.stomp", "v11.stomp", "v10.stomp"];
const SEND_HEADERS_DROPPED: [&str; 4] = ["destination", "content-length", "receipt", "transaction"];

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("missing '{0}' header")]
    MissingHeader(&'static str),
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Protocol(String),
    #[error("must authenticate first")]
    NotConnected,
    #[error("no CONNECT frame within {0} ms")]
    ConnectTimeout(u128),
    #[error("authentication failed")]
    AuthFailed,
    #[error("connection closed")]
    Closed,
}

impl SessionError {
    fn is_fatal(&self) -> bool {
        match self {
            SessionError::Broker(e) => !e.is_recoverable(),
            SessionError::MissingHeader(_) | SessionError::Rejected(_) => false,
            _ => true,
        }
    }
}

enum Inbound {
    Frame(Frame),
    Heartbeat,
    Invalid(FrameError),
    TimedOut,
    Closed,
}

enum Flow {
    Continue,
    Close,
}

/// Per-session values taken from `ServerSettings`.
#[derive(Debug, Clone, Copy)]
struct SessionLimits {
    heartbeat_ms: u64,
    connect_timeout: Duration,
}

/// What the CONNECT frame settled for the session.
struct Negotiated {
    version: Version,
    heartbeat: Heartbeat,
}

pub async fn bind(addr: &str) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Accepts sessions on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, manager: Arc<ConnectionManager>, settings: Settings) {
    let limits = SessionLimits {
        heartbeat_ms: settings.server.heartbeat_ms,
        connect_timeout: Duration::from_millis(settings.server.connect_timeout_ms),
    };
    if let Ok(addr) = listener.local_addr() {
        info!("STOMP over WebSocket listening on ws://{addr}");
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let manager = manager.clone();

        tokio::spawn(async move {
            let ws = match accept_hdr_async(stream, select_subprotocol).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "WebSocket handshake failed");
                    return;
                }
            };
            debug!(%peer, "socket accepted");
            run_session(ws, manager, limits).await;
        });
    }
}

pub async fn start_websocket_server(
    addr: String,
    manager: Arc<ConnectionManager>,
    settings: Settings,
) -> io::Result<()> {
    let listener = bind(&addr).await?;
    serve(listener, manager, settings).await;
    Ok(())
}

/// Echoes back the first STOMP subprotocol the browser offered.
fn select_subprotocol(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok());
    if let Some(offered) = offered {
        let chosen = offered
            .split(',')
            .map(str::trim)
            .find(|p| SUBPROTOCOLS.contains(p));
        if let Some(value) = chosen.and_then(|p| HeaderValue::from_str(p).ok()) {
            response.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }
    }
    Ok(response)
}

async fn run_session(ws: WsStream, manager: Arc<ConnectionManager>, limits: SessionLimits) {
    let (mut sink, mut stream) = ws.split();
    let heartbeat_ms = limits.heartbeat_ms;

    let connection = match manager.open() {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "session refused");
            // answer the CONNECT rather than racing it
            let _ = read_frame(&mut stream, Some(limits.connect_timeout), Version::default()).await;
            let refusal = error_frame(&e.to_string(), None);
            let _ = sink.send(to_ws(&refusal, Version::default())).await;
            let _ = sink.close().await;
            return;
        }
    };

    let negotiated = match handshake(&manager, &connection, &mut stream, limits).await {
        Ok(negotiated) => negotiated,
        Err(e) => {
            if !matches!(e, SessionError::Closed) {
                warn!(connection = connection.id(), error = %e, "handshake rejected");
                let rejection = error_frame(&e.to_string(), None);
                let _ = sink.send(to_ws(&rejection, Version::default())).await;
            }
            let _ = sink.close().await;
            manager.disconnect(&connection);
            return;
        }
    };
    let Negotiated { version, heartbeat } = negotiated;
    debug!(connection = connection.id(), %version, "session connected");

    let connected = Frame::new(Command::Connected)
        .header("version", version.as_str())
        .header("heart-beat", format!("{heartbeat_ms},{heartbeat_ms}"))
        .header("session", connection.id())
        .header("server", SERVER_NAME);
    let inbox = connection.take_inbox();
    let (Ok(()), Some(inbox)) = (sink.send(to_ws(&connected, version)).await, inbox) else {
        manager.disconnect(&connection);
        return;
    };

    let (outgoing, control) = mpsc::unbounded_channel();
    let subscriptions = Arc::new(Mutex::new(SessionSubscriptions::default()));
    let writer = tokio::spawn(write_loop(
        sink,
        control,
        inbox,
        subscriptions.clone(),
        heartbeat.outgoing,
        version,
        connection.id().to_string(),
    ));

    let session = StompSession {
        manager: manager.clone(),
        connection: connection.clone(),
        outgoing,
        subscriptions,
    };
    let read_timeout = heartbeat.read_timeout();

    loop {
        let frame = match read_frame(&mut stream, read_timeout, version).await {
            Inbound::Frame(frame) => frame,
            Inbound::Heartbeat => continue,
            Inbound::Closed => break,
            Inbound::TimedOut => {
                warn!(connection = connection.id(), "no heart-beat from client, closing");
                session.push(error_frame("heart-beat timeout", None));
                break;
            }
            Inbound::Invalid(e) => {
                warn!(connection = connection.id(), error = %e, "malformed frame");
                session.push(error_frame(&e.to_string(), None));
                break;
            }
        };
        if let Flow::Close = session.handle(frame).await {
            break;
        }
    }

    // closing the control channel lets the writer flush and close the socket
    drop(session);
    let _ = writer.await;
    manager.disconnect(&connection);
}

async fn handshake(
    manager: &ConnectionManager,
    connection: &ConnectionHandle,
    stream: &mut SplitStream<WsStream>,
    limits: SessionLimits,
) -> Result<Negotiated, SessionError> {
    let deadline = Instant::now() + limits.connect_timeout;
    let frame = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match read_frame(stream, Some(remaining), Version::default()).await {
            Inbound::Frame(frame) => break frame,
            Inbound::Heartbeat => continue,
            Inbound::Invalid(e) => return Err(e.into()),
            Inbound::TimedOut => {
                return Err(SessionError::ConnectTimeout(limits.connect_timeout.as_millis()));
            }
            Inbound::Closed => return Err(SessionError::Closed),
        }
    };

    if !matches!(frame.command, Command::Connect | Command::Stomp) {
        return Err(SessionError::NotConnected);
    }
    let version = Version::negotiate(frame.get("accept-version")).ok_or_else(|| {
        let supported: Vec<&str> = Version::SUPPORTED.iter().map(|v| v.as_str()).collect();
        SessionError::Protocol(format!(
            "supported protocol versions are {}",
            supported.join(",")
        ))
    })?;
    let client_beat = heartbeat::parse_header(frame.get("heart-beat"))?;

    manager
        .authenticate(connection, &credentials(&frame))
        .map_err(|_| SessionError::AuthFailed)?;

    Ok(Negotiated {
        version,
        heartbeat: Heartbeat::negotiate(client_beat, limits.heartbeat_ms),
    })
}

/// `login`/`passcode` authenticate against the user table; a `passcode`
/// without a `login` is taken as a bearer token.
fn credentials(frame: &Frame) -> Credentials {
    match (frame.get("login"), frame.get("passcode")) {
        (Some(login), passcode) => Credentials::password(login, passcode.unwrap_or_default()),
        (None, Some(token)) => Credentials::Token(token.to_string()),
        (None, None) => Credentials::password("", ""),
    }
}

async fn read_frame(
    stream: &mut SplitStream<WsStream>,
    timeout: Option<Duration>,
    version: Version,
) -> Inbound {
    let next = match timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::TimedOut,
        },
        None => stream.next().await,
    };

    let parsed = match next {
        Some(Ok(WsMessage::Text(text))) => Frame::parse_as(text.as_bytes(), version),
        Some(Ok(WsMessage::Binary(data))) => Frame::parse_as(&data, version),
        Some(Ok(WsMessage::Close(_))) | None => return Inbound::Closed,
        Some(Ok(_)) => return Inbound::Heartbeat,
        Some(Err(e)) => {
            debug!(error = %e, "socket read failed");
            return Inbound::Closed;
        }
    };

    match parsed {
        Ok(Some(frame)) => Inbound::Frame(frame),
        Ok(None) => Inbound::Heartbeat,
        Err(e) => Inbound::Invalid(e),
    }
}

/// Maps router subscription ids to the ids the client chose.
#[derive(Debug, Default)]
struct SessionSubscriptions {
    by_client_id: HashMap<String, SubscriptionId>,
    client_ids: HashMap<SubscriptionId, String>,
}

struct StompSession {
    manager: Arc<ConnectionManager>,
    connection: ConnectionHandle,
    outgoing: UnboundedSender<Frame>,
    subscriptions: Arc<Mutex<SessionSubscriptions>>,
}

impl StompSession {
    fn push(&self, frame: Frame) {
        // the writer is gone once the socket failed; the reader notices soon
        let _ = self.outgoing.send(frame);
    }

    async fn handle(&self, frame: Frame) -> Flow {
        let receipt = frame.get("receipt").map(str::to_owned);
        let command = frame.command;

        let result = match command {
            Command::Send => self.send(frame).await,
            Command::Subscribe => self.subscribe(&frame),
            Command::Unsubscribe => self.unsubscribe(&frame),
            Command::Disconnect => {
                if let Some(receipt) = receipt {
                    self.push(Frame::new(Command::Receipt).header("receipt-id", receipt));
                }
                debug!(connection = self.connection.id(), "client disconnected");
                return Flow::Close;
            }
            Command::Begin | Command::Commit | Command::Abort => Err(SessionError::Rejected(
                "transactions are not supported".to_string(),
            )),
            Command::Ack | Command::Nack => Err(SessionError::Rejected(
                "acknowledgements are not supported".to_string(),
            )),
            Command::Connect | Command::Stomp => {
                Err(SessionError::Protocol("already connected".to_string()))
            }
            Command::Connected | Command::Message | Command::Receipt | Command::Error => Err(
                SessionError::Protocol(format!("unexpected {command} frame from client")),
            ),
        };

        match result {
            Ok(()) => {
                if let Some(receipt) = receipt {
                    self.push(Frame::new(Command::Receipt).header("receipt-id", receipt));
                }
                Flow::Continue
            }
            Err(e) => {
                let fatal = e.is_fatal();
                warn!(
                    connection = self.connection.id(),
                    command = %command,
                    error = %e,
                    fatal,
                    "frame rejected"
                );
                self.push(error_frame(&e.to_string(), receipt.as_deref()));
                if fatal { Flow::Close } else { Flow::Continue }
            }
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        let destination = required(&frame, "destination")?.to_string();
        let headers = frame.headers_except(&SEND_HEADERS_DROPPED);
        self.manager
            .publish(&self.connection, &destination, headers, frame.body)
            .await?;
        Ok(())
    }

    fn subscribe(&self, frame: &Frame) -> Result<(), SessionError> {
        let destination = required(frame, "destination")?;
        let client_id = required(frame, "id")?;
        let mode = Destination::parse(destination)?.mode();

        // held across the router call so the writer cannot see a delivery
        // for a subscription it cannot name yet
        let mut subscriptions = utils::lock(&self.subscriptions);
        if subscriptions.by_client_id.contains_key(client_id) {
            return Err(SessionError::Rejected(format!(
                "subscription id '{client_id}' is already in use"
            )));
        }
        let id = self.manager.subscribe(&self.connection, destination, mode)?;
        subscriptions.by_client_id.insert(client_id.to_string(), id);
        subscriptions.client_ids.insert(id, client_id.to_string());
        Ok(())
    }

    fn unsubscribe(&self, frame: &Frame) -> Result<(), SessionError> {
        let client_id = required(frame, "id")?;
        let removed = {
            let mut subscriptions = utils::lock(&self.subscriptions);
            let id = subscriptions.by_client_id.remove(client_id);
            if let Some(id) = id {
                subscriptions.client_ids.remove(&id);
            }
            id
        };
        if let Some(id) = removed {
            self.manager.unsubscribe(&self.connection, id);
        }
        Ok(())
    }
}

fn required<'a>(frame: &'a Frame, header: &'static str) -> Result<&'a str, SessionError> {
    frame.get(header).ok_or(SessionError::MissingHeader(header))
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut control: UnboundedReceiver<Frame>,
    mut inbox: Receiver<Delivery>,
    subscriptions: Arc<Mutex<SessionSubscriptions>>,
    heartbeat: Option<Duration>,
    version: Version,
    connection_id: String,
) {
    let mut ticker = heartbeat.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        let message = tokio::select! {
            biased;
            frame = control.recv() => match frame {
                Some(frame) => to_ws(&frame, version),
                None => break,
            },
            delivery = inbox.recv() => match delivery {
                Some(delivery) => {
                    let client_id = utils::lock(&subscriptions)
                        .client_ids
                        .get(&delivery.subscription)
                        .cloned();
                    match client_id {
                        Some(client_id) => {
                            to_ws(&message_frame(&client_id, &delivery.envelope), version)
                        }
                        None => {
                            debug!(
                                connection = %connection_id,
                                subscription = %delivery.subscription,
                                "delivery for a closed subscription discarded"
                            );
                            continue;
                        }
                    }
                }
                None => break,
            },
            _ = tick(&mut ticker) => WsMessage::text("\n"),
        };

        if let Err(e) = sink.send(message).await {
            debug!(connection = %connection_id, error = %e, "socket write failed");
            break;
        }
    }

    let _ = sink.close().await;
    debug!(connection = %connection_id, "writer stopped");
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn message_frame(subscription: &str, envelope: &Envelope) -> Frame {
    let mut frame = Frame::new(Command::Message)
        .header("subscription", subscription)
        .header("message-id", envelope.message_id())
        .header("destination", envelope.destination().to_string());
    for (key, value) in envelope.headers().iter() {
        if !matches!(key, "subscription" | "message-id" | "destination" | "content-length") {
            frame = frame.header(key, value);
        }
    }
    frame.body(envelope.body().to_vec())
}

fn error_frame(message: &str, receipt: Option<&str>) -> Frame {
    let mut frame = Frame::new(Command::Error)
        .header("message", message)
        .header("content-type", "text/plain");
    if let Some(receipt) = receipt {
        frame = frame.header("receipt-id", receipt);
    }
    frame.body(message)
}

pub(crate) fn to_ws(frame: &Frame, version: Version) -> WsMessage {
    match String::from_utf8(frame.encode_as(version)) {
        Ok(text) => WsMessage::text(text),
        Err(e) => WsMessage::binary(e.into_bytes()),
    }
}
