//! Structured logging setup and phase/step spans.
//!
//! Library code only emits events; the CLI installs the subscriber once via
//! [`init_tracing`].

use std::time::Duration;

use gpdeploy_redaction::redact_user_string;
use tracing::{Level, error, info, span};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::types::PhaseId;

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` takes precedence. Otherwise `verbose` selects
/// `gpdeploy=debug` with targets and span close events, and the default is a
/// compact `info` stream.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("gpdeploy=debug,info")
            } else {
                EnvFilter::try_new("gpdeploy=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if verbose {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_names(false)
                    .with_line_number(false)
                    .with_file(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_names(false)
                    .with_line_number(false)
                    .with_file(false)
                    .compact(),
            )
            .try_init()?;
    }

    Ok(())
}

/// Span wrapping one phase across all of its hosts.
#[must_use]
pub fn phase_span(phase: PhaseId, hosts: usize) -> tracing::Span {
    span!(Level::INFO, "phase", phase = %phase, hosts = hosts)
}

/// Span wrapping one step on one host.
#[must_use]
pub fn host_step_span(host: &str, phase: PhaseId, step: &str) -> tracing::Span {
    span!(
        Level::INFO,
        "host_step",
        host = %host,
        phase = %phase,
        step = %step,
    )
}

pub fn log_phase_start(phase: PhaseId, hosts: usize) {
    info!(phase = %phase, hosts = hosts, "Starting phase");
}

pub fn log_phase_complete(phase: PhaseId, elapsed: Duration) {
    info!(
        phase = %phase,
        duration_ms = elapsed.as_millis() as u64,
        "Phase completed"
    );
}

/// Log a phase failure. The error text is redacted first.
pub fn log_phase_error(phase: PhaseId, host: Option<&str>, error: &str, elapsed: Duration) {
    let sanitized = redact_user_string(error);
    error!(
        phase = %phase,
        host = host.unwrap_or("-"),
        duration_ms = elapsed.as_millis() as u64,
        error = %sanitized,
        "Phase failed"
    );
}
