//! linux-entra-sso: native messaging host bridging a browser extension to the Entra
//! SSO broker.
//!
//! Without `--interactive` the process serves the browser on stdin/stdout until the
//! browser closes the stream. Arguments the browser appends (extension origin,
//! manifest path) are ignored; the daemon is configured through the environment.

mod cli;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use entra_bridge::{Broker, BrokerClient, Session};

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if cli::wants_interactive(&args) {
        let cli = Cli::parse_from(&args);
        logging::init_tracing(false);
        return match cli::run_interactive(cli).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let cli = Cli::parse_from(args.iter().take(1));
    let log_path = logging::init_tracing(true);
    eprintln!("Running as native messaging instance.");
    eprintln!("For interactive mode, start with --interactive");
    tracing::debug!(
        browser_args = ?args.iter().skip(1).collect::<Vec<_>>(),
        log_file = ?log_path,
        "Starting native messaging host"
    );

    match run_native_messaging(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Native messaging host failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_native_messaging(cli: Cli) -> anyhow::Result<()> {
    if cli.terminate_with_parent {
        terminate_with_parent()?;
    }

    let broker: Arc<dyn Broker> = Arc::new(BrokerClient::new(cli.broker_config()));
    let session = Session::new(
        tokio::io::stdin(),
        tokio::io::stdout(),
        broker,
        cli.session_config(),
    );
    tracing::info!(session = %session.id(), "Native messaging session started");
    session.run().await?;
    Ok(())
}

/// Browsers do not reliably reap the host when they die; ask the kernel to.
#[cfg(target_os = "linux")]
fn terminate_with_parent() -> anyhow::Result<()> {
    nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)?;
    tracing::debug!("Registered parent death signal");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn terminate_with_parent() -> anyhow::Result<()> {
    tracing::warn!("Terminating with the parent process is only supported on Linux");
    Ok(())
}
