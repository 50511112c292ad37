//! Broker client - one subprocess round trip per broker operation.
//!
//! Flow per call:
//! 1. Spawn the broker executable
//! 2. Write one framed JSON request to its stdin, then close stdin
//! 3. Wait for exit (bounded by the call timeout) and collect its output
//! 4. Decode the framed reply
//!
//! The child process is owned by the call that spawned it and is killed if the call is
//! abandoned. Nothing about it outlives the call except the broker state it implies.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::bytes::Bytes;

use crate::bridge::codec::{self, FrameError};
use crate::bridge::protocol::{
    Account, AccountList, BrokerRequest, BrokerState, CookieReply, CookieResult, ErrorMessage,
    SSO_URL_DEFAULT,
};
use crate::version::VersionInfo;

/// Broker executable started for every call.
pub const BROKER_EXECUTABLE: &str =
    r"C:\Program Files\Windows Security\BrowserCore\BrowserCore.exe";

/// Fixed invocation arguments: the extension origin and a detached parent window.
pub const BROKER_ARGS: &[&str] = &[
    "chrome-extension://ppnbnpeolgkicgegkbkbjmhlideopiji/",
    "--parent-window=0",
];

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// `sender` field of cookie requests.
const COOKIE_SENDER: &str = "https://login.microsoftonline.com/";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Broker communication failures.
///
/// All of these are recoverable for the session: the request fails, the bridge keeps
/// serving.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to start broker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("broker I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("broker did not finish within {0:?}")]
    Timeout(Duration),
    #[error("broker protocol error: {0}")]
    Protocol(#[from] FrameError),
    #[error("broker returned no cookies")]
    NoCookies,
}

/// Extension point for different broker launch strategies.
pub trait BrokerSpawner: Send + Sync {
    /// Start a broker process with piped stdin, stdout and stderr.
    fn spawn(&self) -> Result<Child, SpawnError>;

    /// Whether a broker could be started right now.
    fn is_available(&self) -> bool;
}

/// Starts the broker as a plain subprocess.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for CommandSpawner {
    fn default() -> Self {
        Self::new(BROKER_EXECUTABLE, BROKER_ARGS.iter().copied())
    }
}

impl BrokerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    fn is_available(&self) -> bool {
        resolve_executable(&self.program).is_some()
    }
}

/// Locate `program` the way a spawn would: paths are checked directly, bare names are
/// searched on `PATH`.
pub fn resolve_executable(program: &Path) -> Option<PathBuf> {
    if program.is_absolute() || program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[derive(Clone)]
pub struct BrokerConfig {
    /// Upper bound for one round trip; `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub spawner: Arc<dyn BrokerSpawner>,
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self {
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            spawner: Arc::new(CommandSpawner::default()),
        }
    }

    /// Use a different broker executable with the standard arguments.
    pub fn with_executable(mut self, program: impl Into<PathBuf>) -> Self {
        self.spawner = Arc::new(CommandSpawner::new(program, BROKER_ARGS.iter().copied()));
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn BrokerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-listener broker state observer.
///
/// Subscribing replaces the previous listener, whose receiver then sees the channel
/// close. Only transitions are published; the first recorded state is taken as the
/// baseline, which the subscriber is expected to announce itself.
#[derive(Debug, Default)]
pub struct StateNotifier {
    listener: StdMutex<Option<mpsc::UnboundedSender<BrokerState>>>,
    last: StdMutex<Option<BrokerState>>,
}

impl StateNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BrokerState> {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(tx);
        if previous.is_some() {
            tracing::debug!("Replacing broker state listener");
        }
        rx
    }

    /// Record the current state, publishing it if it differs from the last one.
    pub fn record(&self, state: BrokerState) {
        let previous = self
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(state);
        match previous {
            Some(previous) if previous != state => {
                tracing::info!(from = %previous, to = %state, "Broker state changed");
                self.publish(state);
            }
            _ => {}
        }
    }

    pub fn current(&self) -> Option<BrokerState> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: BrokerState) {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        let closed = listener.as_ref().is_some_and(|tx| tx.send(state).is_err());
        if closed {
            tracing::debug!("Broker state listener gone, dropping it");
            *listener = None;
        }
    }
}

/// Operations the dispatcher needs from the broker.
///
/// This abstraction enables testing dispatch and sessions without a broker subprocess.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_accounts(&self) -> Result<AccountList, BrokerError>;

    /// Fetch a PRT SSO cookie for `account`. `sso_url` falls back to
    /// [`SSO_URL_DEFAULT`] when absent or empty.
    async fn acquire_prt_sso_cookie(
        &self,
        account: &Account,
        sso_url: Option<&str>,
        scopes: &[String],
    ) -> Result<CookieResult, BrokerError>;

    async fn acquire_token_silently(
        &self,
        account: &Account,
        scopes: &[String],
    ) -> Result<Value, BrokerError>;

    fn broker_version(&self) -> VersionInfo {
        VersionInfo::new()
    }

    /// Check broker presence and record the result as the current state.
    async fn probe(&self) -> BrokerState;

    /// Register the (single) state change listener.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<BrokerState>;
}

/// First cookie of a reply plus how many others were dropped.
#[derive(Debug)]
pub(crate) struct CookieSelection {
    pub cookie: CookieResult,
    pub discarded: usize,
}

pub(crate) fn select_cookie(reply: CookieReply) -> Result<CookieSelection, BrokerError> {
    let discarded = reply.response.len().saturating_sub(1);
    let first = reply
        .response
        .into_iter()
        .next()
        .ok_or(BrokerError::NoCookies)?;
    let cookie_content = first.content().to_string();
    Ok(CookieSelection {
        cookie: CookieResult {
            cookie_name: first.name,
            cookie_content,
        },
        discarded,
    })
}

/// Broker backed by one subprocess per call.
pub struct BrokerClient {
    config: BrokerConfig,
    notifier: StateNotifier,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            notifier: StateNotifier::new(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: &BrokerRequest) -> Result<T, BrokerError> {
        let frame = codec::encode_frame(request)?;

        let child = match self.config.spawner.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.notifier.record(BrokerState::Offline);
                return Err(e.into());
            }
        };
        tracing::debug!(pid = ?child.id(), "Spawned broker");

        let outcome = match self.config.call_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange(child, frame))
                .await
                .unwrap_or(Err(BrokerError::Timeout(limit))),
            None => exchange(child, frame).await,
        };
        // Hung or broken brokers count as offline.
        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                self.notifier.record(BrokerState::Offline);
                return Err(e);
            }
        };
        self.notifier.record(BrokerState::Online);

        if !output.stderr.is_empty() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "Broker stderr"
            );
        }
        if !output.status.success() {
            tracing::warn!(status = %output.status, "Broker exited with failure status");
        }
        tracing::debug!(reply_bytes = output.stdout.len(), "Received broker reply");

        Ok(codec::decode_frame(&output.stdout)?)
    }
}

/// Send the request frame and wait for the broker to exit.
///
/// A broker may answer and exit without draining stdin. Its output is still collected.
async fn exchange(mut child: Child, frame: Bytes) -> Result<Output, BrokerError> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
    match write_request(&mut stdin, &frame).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!("Broker closed stdin before reading the whole request");
        }
        Err(e) => return Err(e.into()),
    }
    drop(stdin);

    Ok(child.wait_with_output().await?)
}

async fn write_request(stdin: &mut ChildStdin, frame: &[u8]) -> io::Result<()> {
    stdin.write_all(frame).await?;
    stdin.shutdown().await
}

#[async_trait]
impl Broker for BrokerClient {
    async fn get_accounts(&self) -> Result<AccountList, BrokerError> {
        // The broker has no account enumeration; it always acts for the signed-in user.
        Ok(AccountList {
            accounts: vec![Account {
                name: "Windows User".to_string(),
                username: "windows_user".to_string(),
            }],
        })
    }

    async fn acquire_prt_sso_cookie(
        &self,
        account: &Account,
        sso_url: Option<&str>,
        scopes: &[String],
    ) -> Result<CookieResult, BrokerError> {
        let uri = sso_url.filter(|url| !url.is_empty()).unwrap_or(SSO_URL_DEFAULT);
        tracing::debug!(account = %account.username, uri, ?scopes, "Acquiring PRT SSO cookie");

        let reply: CookieReply = self
            .call(&BrokerRequest::GetCookies {
                sender: COOKIE_SENDER.to_string(),
                uri: uri.to_string(),
            })
            .await?;

        let selection = select_cookie(reply)?;
        if selection.discarded > 0 {
            tracing::warn!(
                discarded = selection.discarded,
                cookie = %selection.cookie.cookie_name,
                "Broker returned multiple cookies, using the first"
            );
        }
        Ok(selection.cookie)
    }

    async fn acquire_token_silently(
        &self,
        account: &Account,
        scopes: &[String],
    ) -> Result<Value, BrokerError> {
        tracing::debug!(account = %account.username, ?scopes, "Silent token acquisition requested");
        let result = serde_json::to_value(ErrorMessage::new("not implemented"))
            .map_err(FrameError::Payload)?;
        Ok(result)
    }

    async fn probe(&self) -> BrokerState {
        let state = BrokerState::from_online(self.config.spawner.is_available());
        tracing::debug!(%state, "Probed broker");
        self.notifier.record(state);
        state
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BrokerState> {
        self.notifier.subscribe()
    }
}

/// Re-probe the broker every `interval`. Transitions reach the broker's subscriber.
pub async fn watch(broker: Arc<dyn Broker>, interval: Duration) {
    if interval.is_zero() {
        tracing::warn!("Broker watch interval is zero, not watching");
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; the caller already probed.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        broker.probe().await;
    }
}
