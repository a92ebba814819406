use std::collections::HashMap;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the STOMP server, the broker core and authentication.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub auth: AuthSettings,
}

/// Configuration settings for the server.
///
/// Defines the bind address, the heart-beat interval offered to STOMP
/// clients (milliseconds, `0` disables heart-beats), how long a new socket
/// may wait before sending CONNECT and the log level.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub heartbeat_ms: u64,
    pub connect_timeout_ms: u64,
    pub log_level: String,
}

/// What `publish` does when a recipient's outbound buffer is full.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    Fail,
    Block,
}

/// Configuration settings for the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_connections: usize,
    /// Capacity of each connection's outbound buffer.
    pub outbound_buffer: usize,
    pub backpressure: BackpressureMode,
    /// How long a blocking publish waits for buffer space.
    pub block_timeout_ms: u64,
}

/// Configuration settings for authentication.
///
/// `users` maps STOMP logins to passcodes. `jwt_secret` signs and verifies
/// bearer tokens.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub users: HashMap<String, String>,
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub auth: Option<PartialAuthSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub heartbeat_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub outbound_buffer: Option<usize>,
    pub backpressure: Option<BackpressureMode>,
    pub block_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialAuthSettings {
    pub users: Option<HashMap<String, String>>,
    pub jwt_secret: Option<String>,
    pub token_ttl_secs: Option<u64>,
}

/// Provides default values for `Settings`.
///
/// The default user table holds the `guest`/`guest` account most STOMP
/// brokers ship with.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 15674,
                heartbeat_ms: 10_000,
                connect_timeout_ms: 5_000,
                log_level: "info".to_string(),
            },
            broker: BrokerSettings {
                max_connections: 1000,
                outbound_buffer: 256,
                backpressure: BackpressureMode::Fail,
                block_timeout_ms: 1000,
            },
            auth: AuthSettings {
                users: HashMap::from([("guest".to_string(), "guest".to_string())]),
                jwt_secret: "change-me".to_string(),
                token_ttl_secs: 24 * 60 * 60,
            },
        }
    }
}

impl Settings {
    /// Fills every value missing from `partial` with the default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server.unwrap_or_default();
        let broker = partial.broker.unwrap_or_default();
        let auth = partial.auth.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                heartbeat_ms: server.heartbeat_ms.unwrap_or(default.server.heartbeat_ms),
                connect_timeout_ms: server
                    .connect_timeout_ms
                    .unwrap_or(default.server.connect_timeout_ms),
                log_level: server.log_level.unwrap_or(default.server.log_level),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .max_connections
                    .unwrap_or(default.broker.max_connections),
                outbound_buffer: broker
                    .outbound_buffer
                    .unwrap_or(default.broker.outbound_buffer),
                backpressure: broker.backpressure.unwrap_or(default.broker.backpressure),
                block_timeout_ms: broker
                    .block_timeout_ms
                    .unwrap_or(default.broker.block_timeout_ms),
            },
            auth: AuthSettings {
                users: auth.users.unwrap_or(default.auth.users),
                jwt_secret: auth.jwt_secret.unwrap_or(default.auth.jwt_secret),
                token_ttl_secs: auth.token_ttl_secs.unwrap_or(default.auth.token_ttl_secs),
            },
        }
    }

    /// `host:port` the server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
