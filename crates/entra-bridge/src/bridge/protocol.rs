//! Wire protocol types.
//!
//! Two peers:
//! - **Extension** (stdin/stdout): `{command, ...}` requests, `{command, message}` replies
//! - **Broker subprocess**: `{method, ...}` requests, `{response: [...]}` replies

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authority passed as `ssoUrl` when the extension does not provide one.
///
/// The authorization backend does not validate this value, so a fixed fallback is
/// acceptable. It is not a security boundary.
pub const SSO_URL_DEFAULT: &str = "https://login.microsoftonline.com/";

/// Scopes requested when the caller does not name any.
pub const GRAPH_SCOPES: &[&str] = &["https://graph.microsoft.com/.default"];

/// Command name of unsolicited broker state notifications.
pub const BROKER_STATE_CHANGED: &str = "brokerStateChanged";

/// Generic error text sent to the extension when a request fails.
pub const PROCESSING_ERROR: &str = "Failure during request processing";

pub const UNKNOWN_COMMAND_ERROR: &str = "Unknown command";

pub fn default_scopes() -> Vec<String> {
    GRAPH_SCOPES.iter().map(|s| s.to_string()).collect()
}

/// Commands the bridge understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    AcquirePrtSsoCookie,
    AcquireTokenSilently,
    GetAccounts,
    GetVersion,
}

impl Command {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "acquirePrtSsoCookie" => Some(Self::AcquirePrtSsoCookie),
            "acquireTokenSilently" => Some(Self::AcquireTokenSilently),
            "getAccounts" => Some(Self::GetAccounts),
            "getVersion" => Some(Self::GetVersion),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AcquirePrtSsoCookie => "acquirePrtSsoCookie",
            Self::AcquireTokenSilently => "acquireTokenSilently",
            Self::GetAccounts => "getAccounts",
            Self::GetVersion => "getVersion",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A signed-in account as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountList {
    pub accounts: Vec<Account>,
}

/// Fields of an `acquirePrtSsoCookie` request.
#[derive(Debug, Clone, Deserialize)]
pub struct CookieRequest {
    pub account: Account,
    #[serde(default, rename = "ssoUrl")]
    pub sso_url: Option<String>,
}

/// Fields of an `acquireTokenSilently` request.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    pub account: Account,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

impl TokenRequest {
    /// Requested scopes, falling back to the Graph default when absent or empty.
    pub fn scopes_or_default(&self) -> Vec<String> {
        match &self.scopes {
            Some(scopes) if !scopes.is_empty() => scopes.clone(),
            _ => default_scopes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieResult {
    pub cookie_name: String,
    pub cookie_content: String,
}

/// `{error: "..."}` body used for every error the extension or CLI user sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

impl ErrorMessage {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Broker connectivity as announced to the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerState {
    Online,
    Offline,
}

impl BrokerState {
    pub fn from_online(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for BrokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message to the extension. Paired with requests by command name and order only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    pub message: Value,
}

impl Envelope {
    pub fn new(command: impl Into<String>, message: Value) -> Self {
        Self {
            command: command.into(),
            message,
        }
    }

    pub fn error(command: impl Into<String>, error: &str) -> Self {
        Self::new(command, serde_json::json!({ "error": error }))
    }

    /// Fixed reply for any failed request; details stay in the local log.
    pub fn processing_error(command: impl Into<String>) -> Self {
        Self::error(command, PROCESSING_ERROR)
    }

    pub fn broker_state(state: BrokerState) -> Self {
        Self::new(BROKER_STATE_CHANGED, Value::String(state.as_str().to_string()))
    }
}

/// Requests to the broker subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum BrokerRequest {
    GetCookies { sender: String, uri: String },
}

/// One cookie entry of a `GetCookies` reply. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerCookie {
    pub name: String,
    pub data: String,
}

impl BrokerCookie {
    /// `name=value` part of the raw cookie, attributes dropped.
    pub fn content(&self) -> &str {
        self.data.split(';').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieReply {
    pub response: Vec<BrokerCookie>,
}
