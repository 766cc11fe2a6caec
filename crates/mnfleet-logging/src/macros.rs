//! ---
//! mnf_section: "03-logging"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Structured logging adapters and sinks."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Logging macros attaching a [`crate::LogContext`] to each event.

#[doc(hidden)]
#[macro_export]
macro_rules! __fleet_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            label = ctx.label.unwrap_or(""),
            host = ctx.host.unwrap_or(""),
            stage = ctx.stage.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with fleet context.
#[macro_export]
macro_rules! fleet_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with fleet context.
#[macro_export]
macro_rules! fleet_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with fleet context.
#[macro_export]
macro_rules! fleet_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with fleet context.
#[macro_export]
macro_rules! fleet_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
