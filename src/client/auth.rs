//! Credential checks
//!
//! Clients authenticate either with a login/passcode pair from the
//! configured user table or with an HS256 bearer token signed with the
//! configured secret.

use std::collections::HashMap;
use std::fmt;

use chrono::{TimeDelta, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AuthSettings;
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { login: String, passcode: String },
    Token(String),
}

impl Credentials {
    pub fn password(login: impl Into<String>, passcode: impl Into<String>) -> Self {
        Credentials::Password {
            login: login.into(),
            passcode: passcode.into(),
        }
    }

    /// Name to report in errors and logs. Tokens are never echoed.
    pub fn login(&self) -> &str {
        match self {
            Credentials::Password { login, .. } => login,
            Credentials::Token(_) => "<token>",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct Authenticator {
    users: HashMap<String, String>,
    secret: String,
    token_ttl_secs: u64,
}

impl Authenticator {
    pub fn new(users: HashMap<String, String>, secret: impl Into<String>) -> Self {
        Self {
            users,
            secret: secret.into(),
            token_ttl_secs: 24 * 60 * 60,
        }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self {
            users: settings.users.clone(),
            secret: settings.jwt_secret.clone(),
            token_ttl_secs: settings.token_ttl_secs,
        }
    }

    /// Checks `credentials` and returns the authenticated login.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<String> {
        match credentials {
            Credentials::Password { login, passcode } => match self.users.get(login) {
                Some(expected) if expected == passcode => Ok(login.clone()),
                _ => Err(BrokerError::Auth {
                    login: login.clone(),
                }),
            },
            Credentials::Token(token) => decode::<Claims>(
                token,
                &DecodingKey::from_secret(self.secret.as_bytes()),
                &Validation::default(),
            )
            .map(|data| data.claims.sub)
            .map_err(|e| {
                debug!(error = %e, "token rejected");
                BrokerError::Auth {
                    login: credentials.login().to_string(),
                }
            }),
        }
    }

    /// Signs a token for `login` valid for the configured lifetime.
    pub fn issue_token(&self, login: &str) -> Result<String> {
        let expires = i64::try_from(self.token_ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .and_then(|at| usize::try_from(at.timestamp()).ok())
            .ok_or_else(|| {
                BrokerError::Token(format!(
                    "token lifetime of {}s is out of range",
                    self.token_ttl_secs
                ))
            })?;
        let claims = Claims {
            sub: login.to_string(),
            exp: expires,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| BrokerError::Token(e.to_string()))
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .field("secret", &"<redacted>")
            .finish()
    }
}
