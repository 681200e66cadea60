//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Daemon and runtime configuration loading."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_actuator_capacity() -> usize {
    1024
}

fn default_sensor_capacity() -> usize {
    4096
}

fn default_client_event_capacity() -> usize {
    256
}

fn default_shutdown_quiescence() -> Duration {
    Duration::from_secs(1)
}

fn default_lock_warn_threshold() -> Duration {
    Duration::from_millis(250)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_file() -> bool {
    true
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9898))
}

/// Primary configuration object for the agent runtime daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "AGENTRT_CONFIG";

    /// Load configuration from disk, respecting the `AGENTRT_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.runtime.validate()?;
        if let Some(path) = &self.seed.path {
            if path.as_os_str().is_empty() {
                return Err(anyhow!("seed path must not be empty when set"));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Channel capacities and timing knobs of the runtime itself.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default = "default_actuator_capacity")]
    pub actuator_capacity: usize,
    #[serde(default = "default_sensor_capacity")]
    pub sensor_capacity: usize,
    #[serde(default = "default_client_event_capacity")]
    pub client_event_capacity: usize,
    /// Upper bound granted to driver tasks to settle after `disconnect`.
    #[serde(default = "default_shutdown_quiescence")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub shutdown_quiescence: Duration,
    #[serde(default = "default_lock_warn_threshold")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub lock_warn_threshold: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            actuator_capacity: default_actuator_capacity(),
            sensor_capacity: default_sensor_capacity(),
            client_event_capacity: default_client_event_capacity(),
            shutdown_quiescence: default_shutdown_quiescence(),
            lock_warn_threshold: default_lock_warn_threshold(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("actuator_capacity", self.actuator_capacity),
            ("sensor_capacity", self.sensor_capacity),
            ("client_event_capacity", self.client_event_capacity),
        ] {
            if value == 0 {
                return Err(anyhow!("runtime.{} must be greater than zero", name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Filter directive used when `AGENTRT_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
    /// Also write the rolling JSON log file.
    #[serde(default = "default_log_file")]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            filter: None,
            file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Optional JSON file of assets fed to the runtime at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.runtime, RuntimeConfig::default());
        assert_eq!(config.runtime.shutdown_quiescence, Duration::from_secs(1));
        assert!(config.metrics.enabled);
        assert!(config.seed.path.is_none());
    }

    #[test]
    fn parses_runtime_section() {
        let config: AppConfig = r#"
            [runtime]
            actuator_capacity = 8
            shutdown_quiescence = 3
            lock_warn_threshold = 40

            [logging]
            format = "pretty"
            filter = "agentrt_core=trace"
            file = false
        "#
        .parse()
        .unwrap();
        assert_eq!(config.runtime.actuator_capacity, 8);
        assert_eq!(config.runtime.sensor_capacity, 4096);
        assert_eq!(config.runtime.shutdown_quiescence, Duration::from_secs(3));
        assert_eq!(config.runtime.lock_warn_threshold, Duration::from_millis(40));
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.logging.filter.as_deref(), Some("agentrt_core=trace"));
        assert!(!config.logging.file);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = "[runtime]\nsensor_capacity = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("sensor_capacity"));
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentrt.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[seed]\npath = \"assets.json\"").unwrap();

        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.seed.path, Some(PathBuf::from("assets.json")));
    }
}
