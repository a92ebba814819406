//! STOMP frames
//!
//! A frame is a command line, header lines, a blank line, the body and a NUL
//! octet. Header values are escaped (`\\`, `\n`, `\r`, `\c`) in every frame
//! except CONNECT and CONNECTED. STOMP 1.1 has no `\r` escape and STOMP 1.0
//! escapes nothing. When `content-length` is present it decides where the
//! body ends; otherwise the body runs to the first NUL. A payload made only
//! of end-of-line characters is a heart-beat.

use std::fmt;
use std::str::FromStr;

use crate::broker::Headers;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unknown command '{0}'")]
    InvalidCommand(String),
    #[error("malformed header line '{0}'")]
    MalformedHeader(String),
    #[error("invalid escape sequence in '{0}'")]
    InvalidEscape(String),
    #[error("invalid content-length '{0}'")]
    InvalidContentLength(String),
    #[error("frame is not NUL terminated")]
    MissingNul,
    #[error("frame header is not valid UTF-8")]
    Utf8,
    #[error("unsupported protocol version '{0}'")]
    UnsupportedVersion(String),
}

/// Protocol version agreed on at CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Version {
    V1_0,
    V1_1,
    #[default]
    V1_2,
}

impl Version {
    pub const SUPPORTED: [Version; 3] = [Version::V1_0, Version::V1_1, Version::V1_2];

    pub fn as_str(self) -> &'static str {
        match self {
            Version::V1_0 => "1.0",
            Version::V1_1 => "1.1",
            Version::V1_2 => "1.2",
        }
    }

    /// Highest supported version in an `accept-version` header. A CONNECT
    /// without the header is a STOMP 1.0 client.
    pub fn negotiate(accept_version: Option<&str>) -> Option<Version> {
        let Some(offered) = accept_version else {
            return Some(Version::V1_0);
        };
        offered
            .split(',')
            .filter_map(|v| v.trim().parse().ok())
            .max()
    }
}

impl FromStr for Version {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, FrameError> {
        match s {
            "1.0" => Ok(Version::V1_0),
            "1.1" => Ok(Version::V1_1),
            "1.2" => Ok(Version::V1_2),
            other => Err(FrameError::UnsupportedVersion(other.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::InvalidCommand(other.to_string())),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Raw header lines in wire order. Repeats are kept; lookups return the
    /// first occurrence.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn headers_from(mut self, headers: &Headers) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Headers other than `skip`, first occurrence winning.
    pub fn headers_except(&self, skip: &[&str]) -> Headers {
        let mut headers = Headers::new();
        for (k, v) in &self.headers {
            if !skip.contains(&k.as_str()) && !headers.contains_key(k) {
                headers.insert(k.as_str(), v.as_str());
            }
        }
        headers
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses one STOMP 1.2 frame. Returns `Ok(None)` for a heart-beat.
    pub fn parse(input: &[u8]) -> Result<Option<Frame>, FrameError> {
        Self::parse_as(input, Version::V1_2)
    }

    /// Parses one frame with the header escaping of `version`.
    pub fn parse_as(input: &[u8], version: Version) -> Result<Option<Frame>, FrameError> {
        let input = skip_eols(input);
        if input.is_empty() {
            return Ok(None);
        }

        let (command_line, mut rest) = split_line(input)?;
        let command: Command = command_line.parse()?;

        let mut headers = Vec::new();
        loop {
            let (line, next) = split_line(rest)?;
            rest = next;
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if command.escapes_headers() {
                headers.push((unescape_as(key, version)?, unescape_as(value, version)?));
            } else {
                headers.push((key.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(v.clone()))
            })
            .transpose()?;

        let body = match content_length {
            Some(len) => {
                if rest.len() <= len || rest[len] != 0 {
                    return Err(FrameError::MissingNul);
                }
                rest[..len].to_vec()
            }
            None => {
                let end = rest.iter().position(|b| *b == 0).ok_or(FrameError::MissingNul)?;
                rest[..end].to_vec()
            }
        };

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }

    /// Serializes the frame as STOMP 1.2, adding `content-length` for
    /// non-empty bodies.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_as(Version::V1_2)
    }

    pub fn encode_as(&self, version: Version) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');

        let escape_headers = self.command.escapes_headers();
        for (key, value) in &self.headers {
            if escape_headers {
                out.extend_from_slice(escape_as(key, version).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_as(value, version).as_bytes());
            } else {
                out.extend_from_slice(key.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

fn skip_eols(mut input: &[u8]) -> &[u8] {
    loop {
        match input {
            [b'\n', rest @ ..] => input = rest,
            [b'\r', b'\n', rest @ ..] => input = rest,
            _ => return input,
        }
    }
}

/// Splits off one line, dropping the `\n` or `\r\n` terminator.
fn split_line(input: &[u8]) -> Result<(&str, &[u8]), FrameError> {
    let end = input
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(FrameError::MissingNul)?;
    let line = input[..end].strip_suffix(b"\r").unwrap_or(&input[..end]);
    let line = std::str::from_utf8(line).map_err(|_| FrameError::Utf8)?;
    Ok((line, &input[end + 1..]))
}

pub fn escape(value: &str) -> String {
    escape_as(value, Version::V1_2)
}

pub fn unescape(value: &str) -> Result<String, FrameError> {
    unescape_as(value, Version::V1_2)
}

fn escape_as(value: &str, version: Version) -> String {
    if version == Version::V1_0 {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' if version == Version::V1_2 => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_as(value: &str, version: Version) -> Result<String, FrameError> {
    if version == Version::V1_0 {
        return Ok(value.to_string());
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') if version == Version::V1_2 => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}
