//! Tracing setup for the bridge binary.
//!
//! In native messaging mode stdout carries the protocol, so logs go to an append-only
//! file in the home directory (stderr if that cannot be opened).

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_NAME: &str = "linux-entra-sso.log";

pub fn log_file_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(LOG_FILE_NAME))
}

fn open_log_file() -> Option<(File, PathBuf)> {
    let path = log_file_path()?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .ok()?;
    Some((file, path))
}

/// Map a `LINUX_ENTRA_SSO_LOG` value to a filter level.
fn level_for(value: Option<&str>, default: &'static str) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => default,
    }
}

fn build_filter(default_level: &'static str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = level_for(
        std::env::var("LINUX_ENTRA_SSO_LOG").ok().as_deref(),
        default_level,
    );
    EnvFilter::new(format!("entra_bridge={level},linux_entra_sso={level}"))
}

/// Initialize tracing with RUST_LOG, LINUX_ENTRA_SSO_LOG and LOG_FORMAT support.
///
/// Returns the log file path when logging to a file.
pub fn init_tracing(daemon: bool) -> Option<PathBuf> {
    let filter = build_filter(if daemon { "debug" } else { "warn" });

    let (writer, log_path) = match daemon.then(open_log_file).flatten() {
        Some((file, path)) => (BoxMakeWriter::new(Mutex::new(file)), Some(path)),
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };
    let ansi = !daemon;

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(writer));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(ansi).with_writer(writer));
        let _ = subscriber.try_init();
    }

    log_path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing_accepts_aliases() {
        assert_eq!(level_for(Some("warning"), "debug"), "warn");
        assert_eq!(level_for(Some("error"), "debug"), "error");
        assert_eq!(level_for(Some("loud"), "debug"), "debug");
        assert_eq!(level_for(None, "warn"), "warn");
    }

    #[test]
    fn log_file_lives_in_home() {
        if let Some(path) = log_file_path() {
            assert_eq!(path.file_name().unwrap(), LOG_FILE_NAME);
        }
    }
}
