//! ---
//! mnf_section: "03-logging"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Structured logging adapters and sinks."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Fleet-aware logging helpers: a context carrying the instance label, host
//! address and pipeline stage, plus macros that attach it to every event.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Instance label associated with the log event.
    pub label: Option<&'a str>,
    /// Host address the event concerns.
    pub host: Option<&'a str>,
    /// Pipeline stage (create, pre_setup, install, ...).
    pub stage: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an instance label.
    pub fn with_label(mut self, label: &'a str) -> Self {
        self.label = Some(label);
        self
    }

    /// Attach a host address.
    pub fn with_host(mut self, host: &'a str) -> Self {
        self.host = Some(host);
        self
    }

    /// Attach a pipeline stage.
    pub fn with_stage(mut self, stage: &'a str) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// High-level outcome used when emitting stage log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage completed successfully.
    Success,
    /// The stage failed or was aborted.
    Fault,
}

impl StageOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Success => "success",
            StageOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized stage event with a success/fault outcome.
pub fn log_stage_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: StageOutcome,
) {
    let default = LogContext::default();
    let ctx = context.unwrap_or(&default);
    // `tracing::event!` needs a constant level, hence the two arms.
    match outcome {
        StageOutcome::Success => tracing::event!(
            Level::INFO,
            event,
            outcome = outcome.as_str(),
            label = ctx.label.unwrap_or(""),
            host = ctx.host.unwrap_or(""),
            stage = ctx.stage.unwrap_or(""),
            message = %message
        ),
        StageOutcome::Fault => tracing::event!(
            Level::ERROR,
            event,
            outcome = outcome.as_str(),
            label = ctx.label.unwrap_or(""),
            host = ctx.host.unwrap_or(""),
            stage = ctx.stage.unwrap_or(""),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_label("GLT-MN001")
            .with_host("10.0.0.1");
        fleet_info!(context = ctx.clone(), "instance online");
        fleet_debug!("debug message");
        fleet_warn!(context = ctx.clone(), "slow host: {}s", 30);
        fleet_error!(context = ctx, "exit status: {}", 1);
    }

    #[test]
    fn stage_event_helper_emits() {
        init();
        let ctx = LogContext::new().with_label("GLT-MN001").with_stage("install");
        log_stage_event(
            Some(&ctx),
            "stage.finished",
            "install script completed",
            StageOutcome::Success,
        );
        log_stage_event(None, "stage.finished", "install failed", StageOutcome::Fault);
    }
}
