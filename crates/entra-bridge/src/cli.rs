//! Command-line options and the interactive (single-shot) mode.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use entra_bridge::bridge::protocol::default_scopes;
use entra_bridge::broker::{self, DEFAULT_CALL_TIMEOUT};
use entra_bridge::{
    Account, AccountList, Broker, BrokerClient, BrokerConfig, BrokerState, Envelope,
    ErrorMessage, SSO_URL_DEFAULT, SessionConfig, UnknownCommandPolicy,
};

/// Probe interval for `monitor` when no poll interval is configured.
const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InteractiveCommand {
    #[value(name = "getAccounts")]
    GetAccounts,
    #[value(name = "getVersion")]
    GetVersion,
    #[value(name = "acquirePrtSsoCookie")]
    AcquirePrtSsoCookie,
    #[value(name = "acquireTokenSilently")]
    AcquireTokenSilently,
    /// Print broker state changes until interrupted
    #[value(name = "monitor")]
    Monitor,
}

/// Entra SSO native messaging host.
#[derive(Debug, Parser)]
#[command(name = "linux-entra-sso", about, version)]
pub struct Cli {
    /// Run in interactive mode
    #[arg(short, long, default_value_t = false)]
    pub interactive: bool,

    /// Account index to use for operations
    #[arg(short, long, default_value_t = 0)]
    pub account: usize,

    /// ssoUrl part of SSO PRT cookie request
    #[arg(short = 's', long = "ssoUrl", default_value = SSO_URL_DEFAULT)]
    pub sso_url: String,

    /// Broker executable to start for each request
    #[arg(long, env = "LINUX_ENTRA_SSO_BROKER")]
    pub broker: Option<PathBuf>,

    /// Seconds to wait for one broker call (0 waits forever)
    #[arg(
        long = "broker-timeout",
        env = "LINUX_ENTRA_SSO_BROKER_TIMEOUT",
        default_value_t = DEFAULT_CALL_TIMEOUT.as_secs()
    )]
    pub broker_timeout: u64,

    /// Seconds between broker presence checks (0 disables)
    #[arg(
        long = "poll-interval",
        env = "LINUX_ENTRA_SSO_POLL_INTERVAL",
        default_value_t = 0
    )]
    pub poll_interval: u64,

    /// Answer unknown commands with an error instead of ignoring them
    #[arg(
        long = "reject-unknown-commands",
        env = "LINUX_ENTRA_SSO_REJECT_UNKNOWN",
        default_value_t = false
    )]
    pub reject_unknown_commands: bool,

    /// Exit when the parent (browser) process dies
    #[arg(
        long = "terminate-with-parent",
        env = "LINUX_ENTRA_SSO_TERMINATE_WITH_PARENT",
        default_value_t = false
    )]
    pub terminate_with_parent: bool,

    /// Command to run in interactive mode
    #[arg(value_enum, required_if_eq("interactive", "true"))]
    pub command: Option<InteractiveCommand>,
}

impl Cli {
    pub fn broker_config(&self) -> BrokerConfig {
        let config = BrokerConfig::new().with_call_timeout(seconds(self.broker_timeout));
        match &self.broker {
            Some(program) => config.with_executable(program),
            None => config,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let policy = if self.reject_unknown_commands {
            UnknownCommandPolicy::Reject
        } else {
            UnknownCommandPolicy::Ignore
        };
        SessionConfig::new()
            .with_unknown_commands(policy)
            .with_poll_interval(seconds(self.poll_interval))
    }

    fn monitor_interval(&self) -> Duration {
        seconds(self.poll_interval).unwrap_or(DEFAULT_MONITOR_INTERVAL)
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Interactive mode is opt-in by flag; anything else is a browser launching the host.
pub fn wants_interactive(args: &[String]) -> bool {
    args.iter()
        .skip(1)
        .any(|arg| arg == "-i" || arg == "--interactive")
}

pub async fn run_interactive(cli: Cli) -> anyhow::Result<ExitCode> {
    let broker: Arc<dyn Broker> = Arc::new(BrokerClient::new(cli.broker_config()));
    let mut stdout = io::stdout();
    execute(&cli, broker, &mut stdout, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Run the selected command, writing results to `out`. `shutdown` ends `monitor`.
async fn execute<W, F>(
    cli: &Cli,
    broker: Arc<dyn Broker>,
    out: &mut W,
    shutdown: F,
) -> anyhow::Result<ExitCode>
where
    W: Write,
    F: Future<Output = ()>,
{
    let Some(command) = cli.command else {
        anyhow::bail!("no command given");
    };

    let accounts = broker.get_accounts().await?;
    if accounts.accounts.is_empty() {
        eprintln!("warning: no accounts registered.");
    }

    match command {
        InteractiveCommand::GetAccounts => print_json(out, &accounts)?,
        InteractiveCommand::GetVersion => print_json(out, &broker.broker_version())?,
        InteractiveCommand::AcquirePrtSsoCookie => {
            let Some(account) = select_account(&accounts, cli.account) else {
                return invalid_account_index(out, cli.account);
            };
            let cookie = broker
                .acquire_prt_sso_cookie(account, Some(&cli.sso_url), &default_scopes())
                .await?;
            print_json(out, &cookie)?;
        }
        InteractiveCommand::AcquireTokenSilently => {
            let Some(account) = select_account(&accounts, cli.account) else {
                return invalid_account_index(out, cli.account);
            };
            let token = broker
                .acquire_token_silently(account, &default_scopes())
                .await?;
            print_json(out, &token)?;
        }
        InteractiveCommand::Monitor => {
            monitor(broker, cli.monitor_interval(), out, shutdown).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn select_account(accounts: &AccountList, index: usize) -> Option<&Account> {
    accounts.accounts.get(index)
}

fn invalid_account_index<W: Write>(out: &mut W, index: usize) -> anyhow::Result<ExitCode> {
    print_json(out, &ErrorMessage::new(format!("invalid account index {index}")))?;
    Ok(ExitCode::FAILURE)
}

/// Pretty JSON followed by a newline.
fn print_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

/// One compact notification per line, flushed so pipes see it immediately.
fn print_state<W: Write>(out: &mut W, state: BrokerState) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, &Envelope::broker_state(state))?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

async fn monitor<W, F>(
    broker: Arc<dyn Broker>,
    interval: Duration,
    out: &mut W,
    shutdown: F,
) -> anyhow::Result<()>
where
    W: Write,
    F: Future<Output = ()>,
{
    let mut states = broker.subscribe();
    print_state(out, broker.probe().await)?;

    let watcher = tokio::spawn(broker::watch(Arc::clone(&broker), interval));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            state = states.recv() => match state {
                Some(state) => print_state(out, state)?,
                None => break,
            },
        }
    }

    watcher.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn browser_launch_is_not_interactive() {
        assert!(!wants_interactive(&args(&[
            "linux-entra-sso",
            "chrome-extension://jlnfnnolkbjieggibinobhkjdfbpcohn/",
        ])));
        assert!(!wants_interactive(&args(&[
            "linux-entra-sso",
            "/usr/lib/mozilla/native-messaging-hosts/linux_entra_sso.json",
            "linux-entra-sso@example.com",
        ])));
        assert!(wants_interactive(&args(&["linux-entra-sso", "-i", "getVersion"])));
        assert!(wants_interactive(&args(&["linux-entra-sso", "getVersion", "--interactive"])));
    }

    #[test]
    fn interactive_options_parse() {
        let cli = Cli::try_parse_from([
            "linux-entra-sso",
            "--interactive",
            "-a",
            "1",
            "--ssoUrl",
            "https://login.microsoftonline.com/common/",
            "acquirePrtSsoCookie",
        ])
        .unwrap();

        assert!(cli.interactive);
        assert_eq!(cli.account, 1);
        assert_eq!(cli.sso_url, "https://login.microsoftonline.com/common/");
        assert_eq!(cli.command, Some(InteractiveCommand::AcquirePrtSsoCookie));
    }

    #[test]
    fn interactive_mode_requires_command() {
        assert!(Cli::try_parse_from(["linux-entra-sso", "-i"]).is_err());
        assert!(Cli::try_parse_from(["linux-entra-sso", "-i", "getTokens"]).is_err());
    }

    #[test]
    fn defaults_match_native_messaging_mode() {
        let cli = Cli::try_parse_from(["linux-entra-sso"]).unwrap();

        assert!(!cli.interactive);
        assert_eq!(cli.account, 0);
        assert_eq!(cli.sso_url, SSO_URL_DEFAULT);
        assert!(cli.command.is_none());
    }

    #[test]
    fn zero_seconds_disable_timers() {
        assert_eq!(seconds(0), None);
        assert_eq!(seconds(7), Some(Duration::from_secs(7)));

        let cli = Cli::try_parse_from(["linux-entra-sso", "--poll-interval", "0"]).unwrap();
        assert_eq!(cli.session_config().poll_interval, None);
        assert_eq!(cli.monitor_interval(), DEFAULT_MONITOR_INTERVAL);
    }

    #[test]
    fn reject_flag_selects_policy() {
        let cli = Cli::try_parse_from(["linux-entra-sso", "--reject-unknown-commands"]).unwrap();
        assert_eq!(
            cli.session_config().unknown_commands,
            UnknownCommandPolicy::Reject
        );
    }

    fn default_broker() -> Arc<dyn Broker> {
        Arc::new(BrokerClient::new(BrokerConfig::new()))
    }

    #[tokio::test]
    async fn invalid_account_index_prints_error_and_fails() {
        let cli = Cli::try_parse_from(["linux-entra-sso", "-i", "-a", "5", "acquirePrtSsoCookie"])
            .unwrap();
        let mut out = Vec::new();

        let code = execute(&cli, default_broker(), &mut out, std::future::pending())
            .await
            .unwrap();

        assert_eq!(code, ExitCode::FAILURE);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\n  \"error\": \"invalid account index 5\"\n}\n"
        );
    }

    #[tokio::test]
    async fn get_accounts_prints_pretty_json() {
        let cli = Cli::try_parse_from(["linux-entra-sso", "-i", "getAccounts"]).unwrap();
        let mut out = Vec::new();

        let code = execute(&cli, default_broker(), &mut out, std::future::pending())
            .await
            .unwrap();

        assert_eq!(code, ExitCode::SUCCESS);
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.ends_with("}\n"));
        let value: serde_json::Value = serde_json::from_str(&printed).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"accounts": [{"name": "Windows User", "username": "windows_user"}]})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_prints_current_state_then_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let executable = dir.path().join("BrowserCore.exe");
        std::fs::write(&executable, b"").unwrap();

        let cli = Cli::try_parse_from(["linux-entra-sso", "-i", "--poll-interval", "1", "monitor"])
            .unwrap();
        let broker: Arc<dyn Broker> = Arc::new(BrokerClient::new(
            BrokerConfig::new().with_executable(&executable),
        ));

        let mut out = Vec::new();
        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            std::fs::remove_file(&executable).unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        };
        let code = execute(&cli, broker, &mut out, shutdown).await.unwrap();

        assert_eq!(code, ExitCode::SUCCESS);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            concat!(
                r#"{"command":"brokerStateChanged","message":"online"}"#,
                "\n",
                r#"{"command":"brokerStateChanged","message":"offline"}"#,
                "\n",
            )
        );
    }

    #[test]
    fn account_index_out_of_range_is_none() {
        let accounts = AccountList {
            accounts: vec![Account {
                name: "Windows User".to_string(),
                username: "windows_user".to_string(),
            }],
        };
        assert!(select_account(&accounts, 0).is_some());
        assert!(select_account(&accounts, 1).is_none());
    }
}
