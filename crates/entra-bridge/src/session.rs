//! Session loop - owns the extension stream for the lifetime of the process.
//!
//! Flow:
//! 1. Subscribe to broker state changes, probe the broker once
//! 2. Announce the probed state to the extension
//! 3. Forward later state changes in the background (optionally re-probing)
//! 4. Read, dispatch and answer one request at a time until the extension hangs up
//!
//! Only a clean end of stream ends the loop successfully. A malformed frame ends it
//! with an error since the stream position can no longer be trusted. Failed requests
//! never end it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::Instrument;
use uuid::Uuid;

use crate::bridge::codec::{self, FrameError, JsonCodec};
use crate::bridge::protocol::{BrokerState, Envelope};
use crate::broker::{self, Broker};
use crate::dispatcher::{Dispatcher, Outbound, UnknownCommandPolicy};

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub unknown_commands: UnknownCommandPolicy,
    /// Re-probe the broker this often and announce transitions. `None` disables it.
    pub poll_interval: Option<Duration>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unknown_commands(mut self, policy: UnknownCommandPolicy) -> Self {
        self.unknown_commands = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval.filter(|i| !i.is_zero());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("malformed frame from extension: {0}")]
    MalformedFrame(#[source] FrameError),
    #[error("failed to write to extension: {0}")]
    Write(#[source] FrameError),
}

pub struct Session<R, W> {
    id: Uuid,
    reader: FramedRead<R, JsonCodec<Value>>,
    outbound: Outbound<W>,
    dispatcher: Dispatcher,
    broker: Arc<dyn Broker>,
    poll_interval: Option<Duration>,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, broker: Arc<dyn Broker>, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            reader: FramedRead::new(reader, JsonCodec::new()),
            outbound: Outbound::new(writer),
            dispatcher: Dispatcher::new(Arc::clone(&broker))
                .with_unknown_commands(config.unknown_commands),
            broker,
            poll_interval: config.poll_interval,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serve the extension until it closes the stream.
    pub async fn run(self) -> Result<(), SessionError> {
        let span = tracing::info_span!("session", id = %self.id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> Result<(), SessionError> {
        let states = self.broker.subscribe();
        let initial = self.broker.probe().await;
        tracing::info!(state = %initial, "Initial broker state");
        self.outbound
            .notify_state(initial)
            .await
            .map_err(SessionError::Write)?;

        let mut background = vec![tokio::spawn(
            forward_state_changes(states, self.outbound.clone()).in_current_span(),
        )];
        if let Some(interval) = self.poll_interval {
            tracing::debug!(?interval, "Watching broker state");
            background.push(tokio::spawn(
                broker::watch(Arc::clone(&self.broker), interval).in_current_span(),
            ));
        }

        let result = self.serve().await;

        for task in background {
            task.abort();
            let _ = task.await;
        }
        result
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        loop {
            let frame = match codec::decode_next(&mut self.reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("Extension closed the stream");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Malformed frame, ending session");
                    return Err(SessionError::MalformedFrame(e));
                }
            };

            let Some(command) = frame.get("command").and_then(Value::as_str) else {
                tracing::warn!("Ignoring message without a command");
                continue;
            };
            let command = command.to_string();
            tracing::debug!(%command, "Received command");

            let response = match self.dispatcher.handle(&command, frame).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(%command, error = %e, "Processing error");
                    Some(Envelope::processing_error(command))
                }
            };

            if let Some(response) = response {
                self.outbound
                    .send(response)
                    .await
                    .map_err(SessionError::Write)?;
            }
        }
    }
}

async fn forward_state_changes<W>(
    mut states: mpsc::UnboundedReceiver<BrokerState>,
    outbound: Outbound<W>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(state) = states.recv().await {
        if let Err(e) = outbound.notify_state(state).await {
            tracing::warn!(error = %e, %state, "Failed to forward broker state");
            break;
        }
    }
}
