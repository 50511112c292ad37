//! Command dispatch and the outbound write path.
//!
//! The dispatcher turns one request into at most one response envelope. Writing that
//! envelope, and any broker state notification, goes through [`Outbound`], which owns
//! the only handle to the extension-facing stream.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::{self, FrameError, JsonCodec};
use crate::bridge::protocol::{
    BrokerState, Command, CookieRequest, Envelope, TokenRequest, UNKNOWN_COMMAND_ERROR,
    default_scopes,
};
use crate::broker::{Broker, BrokerError};

/// What to do with a command the bridge does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownCommandPolicy {
    /// Log and send nothing. Lets newer extensions probe for commands.
    #[default]
    Ignore,
    /// Answer with an `Unknown command` error envelope.
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid {command} request: {source}")]
    InvalidRequest {
        command: Command,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {command} result: {source}")]
    Encode {
        command: Command,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    unknown_commands: UnknownCommandPolicy,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            unknown_commands: UnknownCommandPolicy::default(),
        }
    }

    pub fn with_unknown_commands(mut self, policy: UnknownCommandPolicy) -> Self {
        self.unknown_commands = policy;
        self
    }

    /// Run `command` against the broker and build its response.
    ///
    /// `fields` is the whole inbound message. Errors are left for the caller to turn
    /// into the generic processing-error envelope.
    pub async fn handle(
        &self,
        command: &str,
        fields: Value,
    ) -> Result<Option<Envelope>, DispatchError> {
        let Some(cmd) = Command::from_name(command) else {
            return Ok(self.unknown(command));
        };
        tracing::debug!(command = %cmd, "Handling command");

        let message = match cmd {
            Command::AcquirePrtSsoCookie => {
                let request: CookieRequest = parse(cmd, fields)?;
                let cookie = self
                    .broker
                    .acquire_prt_sso_cookie(
                        &request.account,
                        request.sso_url.as_deref(),
                        &default_scopes(),
                    )
                    .await?;
                encode(cmd, cookie)?
            }
            Command::AcquireTokenSilently => {
                let request: TokenRequest = parse(cmd, fields)?;
                self.broker
                    .acquire_token_silently(&request.account, &request.scopes_or_default())
                    .await?
            }
            Command::GetAccounts => encode(cmd, self.broker.get_accounts().await?)?,
            Command::GetVersion => encode(cmd, self.broker.broker_version())?,
        };

        Ok(Some(Envelope::new(cmd.name(), message)))
    }

    fn unknown(&self, command: &str) -> Option<Envelope> {
        match self.unknown_commands {
            UnknownCommandPolicy::Ignore => {
                tracing::warn!(command, "Ignoring unknown command");
                None
            }
            UnknownCommandPolicy::Reject => {
                tracing::warn!(command, "Rejecting unknown command");
                Some(Envelope::error(command, UNKNOWN_COMMAND_ERROR))
            }
        }
    }
}

fn parse<T: DeserializeOwned>(command: Command, fields: Value) -> Result<T, DispatchError> {
    serde_json::from_value(fields)
        .map_err(|source| DispatchError::InvalidRequest { command, source })
}

fn encode<T: Serialize>(command: Command, result: T) -> Result<Value, DispatchError> {
    serde_json::to_value(result).map_err(|source| DispatchError::Encode { command, source })
}

type EnvelopeWriter<W> = FramedWrite<W, JsonCodec<Envelope>>;

/// Shared, serialized writer for the extension-facing stream.
///
/// Every frame (response or notification) is written while holding one lock, from
/// encode through flush, so frames from different tasks never interleave.
pub struct Outbound<W> {
    writer: Arc<Mutex<EnvelopeWriter<W>>>,
}

impl<W> Clone for Outbound<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<W: AsyncWrite + Unpin> Outbound<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(FramedWrite::new(writer, JsonCodec::new()))),
        }
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), FrameError> {
        tracing::debug!(command = %envelope.command, "Sending message");
        let mut writer = self.writer.lock().await;
        codec::send(&mut writer, envelope).await
    }

    pub async fn notify_state(&self, state: BrokerState) -> Result<(), FrameError> {
        self.send(Envelope::broker_state(state)).await
    }
}
