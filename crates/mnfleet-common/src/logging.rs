//! ---
//! mnf_section: "03-logging"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Tracing subscriber setup for the fleet tools: console on stderr, daily JSON run log."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Tracing setup.
//!
//! Command results go to stdout (JSON listings, tab-separated host reports),
//! so console logging is written to stderr and never mixes with them. Every
//! run also appends to a daily JSON log under the configured directory;
//! provisioning waits can last hours and the file is what operators read
//! afterwards.

use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "MNFLEET_LOG";

/// HTTP client internals are noisy at `info` during long status polls.
pub const DEFAULT_DIRECTIVE: &str = "info,hyper=warn,reqwest=warn";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static CONSOLE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Available log formats for console output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Filter directive in effect: `MNFLEET_LOG`, then `RUST_LOG`, then
/// `logging.level`, then [`DEFAULT_DIRECTIVE`].
pub fn filter_directive(config: &LoggingConfig) -> String {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .chain(config.level.clone())
        .find(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_owned())
}

/// Daily log file name for `service`, before the appender's date suffix.
pub fn log_file_name(service: &str, config: &LoggingConfig) -> String {
    let stem = config.file_prefix.as_deref().unwrap_or(service);
    format!("{stem}.jsonl")
}

/// Install the global subscriber for `service`.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init_tracing(service: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    let file_name = log_file_name(service, config);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, &file_name));
    let (console_writer, console_guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = FILE_GUARD.set(file_guard);
    let _ = CONSOLE_GUARD.set(console_guard);

    let directive = filter_directive(config);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log filter {directive:?} ({err}); using {DEFAULT_DIRECTIVE:?}");
        EnvFilter::new(DEFAULT_DIRECTIVE)
    });

    let console = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(console_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .compact()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(console_writer)
            .boxed(),
    };
    let run_log = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(run_log)
        .try_init()
        .ok();

    let log_path: PathBuf = config.directory.join(&file_name);
    info!(
        service,
        log_file = %log_path.display(),
        filter = %directive,
        "tracing initialised"
    );
    Ok(())
}
