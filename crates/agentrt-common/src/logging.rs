//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing subscriber bootstrap for runtime binaries."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
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

const LOG_ENV: &str = "AGENTRT_LOG";

/// Runtime internals at debug, everything else at info.
pub const DEFAULT_FILTER: &str = "info,agentrt_core=debug,agentrt_protocol=debug";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Where the active filter directive came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FilterSource {
    Environment,
    Config,
    RustLog,
    Default,
}

/// Pick the filter directive: `AGENTRT_LOG`, then `[logging] filter`, then `RUST_LOG`.
pub fn resolve_filter(
    agentrt_log: Option<&str>,
    configured: Option<&str>,
    rust_log: Option<&str>,
) -> (String, FilterSource) {
    let candidates = [
        (agentrt_log, FilterSource::Environment),
        (configured, FilterSource::Config),
        (rust_log, FilterSource::RustLog),
    ];
    candidates
        .into_iter()
        .find_map(|(directive, source)| {
            directive
                .map(str::trim)
                .filter(|directive| !directive.is_empty())
                .map(|directive| (directive.to_owned(), source))
        })
        .unwrap_or_else(|| (DEFAULT_FILTER.to_owned(), FilterSource::Default))
}

/// Install the global subscriber for `service_name`.
///
/// Stdout gets the configured format. Unless `[logging] file = false`, a rolling daily
/// JSON file named after the prefix (the service name by default) is written as well.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let agentrt_log = std::env::var(LOG_ENV).ok();
    let rust_log = std::env::var("RUST_LOG").ok();
    let (directive, source) = resolve_filter(
        agentrt_log.as_deref(),
        config.filter.as_deref(),
        rust_log.as_deref(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid {source} log filter {directive:?} ({err}); using {DEFAULT_FILTER}");
        EnvFilter::new(DEFAULT_FILTER)
    });

    let mut guards = Vec::with_capacity(2);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = if config.file {
        std::fs::create_dir_all(&config.directory)?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (file_writer, file_guard) =
            tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
        guards.push(file_guard);
        Some(
            fmt::layer()
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(file_writer)
                .boxed(),
        )
    } else {
        None
    };
    let _ = GUARDS.set(guards);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        filter = %directive,
        filter_source = %source,
        log_file = config.file,
        log_dir = %config.directory.display(),
        "tracing initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_directive_wins() {
        assert_eq!(
            resolve_filter(Some("trace"), Some("warn"), Some("error")),
            ("trace".to_owned(), FilterSource::Environment)
        );
    }

    #[test]
    fn config_directive_precedes_rust_log() {
        assert_eq!(
            resolve_filter(None, Some("agentrt_core=trace"), Some("error")),
            ("agentrt_core=trace".to_owned(), FilterSource::Config)
        );
        assert_eq!(
            resolve_filter(Some("  "), None, Some("error")),
            ("error".to_owned(), FilterSource::RustLog)
        );
    }

    #[test]
    fn falls_back_to_runtime_default() {
        let (directive, source) = resolve_filter(None, Some(""), None);
        assert_eq!(source, FilterSource::Default);
        assert_eq!(directive, DEFAULT_FILTER);
        assert!(EnvFilter::try_new(directive).is_ok());
    }
}
