//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the agent runtime daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod seed;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use agentrt_common::{init_tracing, AppConfig};
use agentrt_core::{AgentRuntime, AssetStore, InMemoryAssetStore};
use agentrt_metrics::{new_registry, spawn_http_server, DaemonMetrics, RuntimeMetrics, SharedRegistry};
use agentrt_model::Asset;
use agentrt_msg::{require_role, ClientEvent, ClientSubscription, SubscriberInfo, READ_ASSETS_ROLE};
use agentrt_protocol::ProtocolRegistry;

const DEFAULT_CONFIG_PATH: &str = "configs/agentrtd.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "Agent and protocol runtime daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "JSON array of assets loaded at startup")]
    seed: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the agent runtime")]
    Run,
    #[command(about = "List registered protocol drivers")]
    Protocols,
    #[command(about = "Check the protocol configurations of seeded agents")]
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let load_started = Instant::now();
    let (config, config_path) = load_config(&cli)?;
    let load_duration = load_started.elapsed();

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );

    init_tracing("agentrtd", &config.logging)?;
    match &config_path {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }

    let protocols = ProtocolRegistry::with_builtin()?;
    daemon_metrics.set_protocols(protocols.len());

    let seed_path = cli.seed.clone().or_else(|| config.seed.path.clone());
    let assets = match &seed_path {
        Some(path) => seed::load_seed(path)?,
        None => Vec::new(),
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, assets, protocols, metrics_registry).await?,
        Commands::Protocols => {
            println!("{}", serde_json::to_string_pretty(&protocols.descriptors())?);
        }
        Commands::Validate => {
            if seed_path.is_none() {
                return Err(anyhow!("validate needs a seed file (--seed or [seed] path)"));
            }
            let checks = seed::check_configurations(&assets, &protocols);
            let mut failed = 0usize;
            for check in &checks {
                match &check.problem {
                    None => println!("ok      {} ({})", check.configuration, check.protocol),
                    Some(problem) => {
                        failed += 1;
                        println!("invalid {} ({}): {}", check.configuration, check.protocol, problem);
                    }
                }
            }
            if failed > 0 {
                return Err(anyhow!("{failed} of {} protocol configurations are invalid", checks.len()));
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<(AppConfig, Option<PathBuf>)> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));

    let explicit = cli.config.is_some() || std::env::var_os(AppConfig::ENV_CONFIG_PATH).is_some();
    if !explicit && !candidates.iter().any(|candidate| candidate.exists()) {
        return Ok((AppConfig::default(), None));
    }
    let loaded = AppConfig::load_with_source(&candidates)?;
    Ok((loaded.config, Some(loaded.source)))
}

async fn run_daemon(
    config: AppConfig,
    assets: Vec<Asset>,
    protocols: ProtocolRegistry,
    metrics_registry: SharedRegistry,
) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let store = Arc::new(InMemoryAssetStore::new());
    let seeded = assets.len();
    for asset in assets {
        store.merge(asset)?;
    }
    info!(assets = seeded, "seed assets stored");

    let runtime = Arc::new(
        AgentRuntime::builder(config.runtime.clone())
            .protocols(protocols)
            .store(store.clone())
            .metrics(RuntimeMetrics::new(metrics_registry)?)
            .build(),
    );
    let events = console_events(&runtime)?;
    let problems = runtime.start();
    if !problems.is_empty() {
        warn!(problems = problems.len(), "agent runtime started with configuration problems");
    }
    let handle = runtime.clone().spawn();

    let sender = handle.persistence_sender();
    store.set_listener(move |event| {
        if sender.send(event).is_err() {
            warn!("runtime loop stopped; persistence event dropped");
        }
    });

    let (stop_tx, mut stop_rx) = broadcast::channel::<()>(1);
    let logger = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                event = events.next() => log_client_event(&event),
            }
        }
    });

    info!("daemon running; waiting for termination signal");
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("ctrl-c received; shutting down");
                break;
            }
            _ = watchdog.tick() => {
                if handle.is_finished() {
                    warn!("agent runtime stopped; shutting down");
                    break;
                }
            }
        }
    }

    let stopped = handle.shutdown().await;
    let _ = stop_tx.send(());
    if let Err(err) = logger.await {
        error!(error = %err, "client event logger join error");
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    stopped?;
    Ok(())
}

/// Console event stream; only subscribers holding the asset read role are admitted.
fn console_events(runtime: &AgentRuntime) -> Result<ClientSubscription> {
    runtime
        .router()
        .client_events()
        .add_authorizer(require_role(READ_ASSETS_ROLE));
    Ok(runtime.subscribe_client_events(SubscriberInfo::new([READ_ASSETS_ROLE], None))?)
}

fn log_client_event(event: &ClientEvent) {
    match event {
        ClientEvent::AgentStatus(status) => info!(
            realm = %status.realm,
            configuration = %status.protocol_configuration,
            status = %status.connection_status,
            "agent status changed"
        ),
        ClientEvent::Attribute { realm, event } => debug!(
            realm = %realm,
            attribute = %event.attribute_ref,
            value = %event.value,
            "attribute updated"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_common::RuntimeConfig;

    #[test]
    fn console_events_require_asset_read_role() {
        let runtime = AgentRuntime::builder(RuntimeConfig::default()).build();
        assert!(console_events(&runtime).is_ok());
        assert!(runtime
            .subscribe_client_events(SubscriberInfo::new(["write:assets"], None))
            .is_err());
        assert!(runtime
            .subscribe_client_events(SubscriberInfo::new([READ_ASSETS_ROLE], Some("tenant".into())))
            .is_ok());
    }
}
