//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the agent runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the agent runtime workspace.
//! This crate exposes configuration loading, logging bootstrap, clocks and
//! the coordination lock that serialises every registry mutation and driver call.

pub mod config;
pub mod coordination;
pub mod logging;
pub mod time;

pub use config::{AppConfig, LoggingConfig, MetricsConfig, RuntimeConfig, SeedConfig};
pub use coordination::Coordinator;
pub use logging::{init_tracing, resolve_filter, FilterSource, LogFormat, DEFAULT_FILTER};
pub use time::{Clock, ManualClock, SystemClock};
