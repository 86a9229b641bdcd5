//! Karlsen Stratum Bridge - Main Application

use anyhow::Context;
use clap::Parser;
use karlsen_stratum_bridge::{
    config::{Args, BridgeConfig},
    health,
    logging::init_logging,
    node::HttpNodeConnector,
    stats::NetworkStats,
    stratum::{
        default_handlers, jobs::TemplateSource, ExtranonceAllocator, ListenerConfig,
        MethodDispatcher, StratumListener,
    },
    BridgeSettings, UpstreamBridge, APP_NAME, APP_VERSION,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = BridgeConfig::load(&args).context("invalid configuration")?;

    if args.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let _log_guard = init_logging(&config)?;

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Configuration: stratum={}, node={}, network={}, block_wait_time={:?}, min_share_diff={}, extranonce_size={}",
        config.stratum_port,
        config.karlsend_address,
        config.network(),
        config.block_wait_time,
        config.min_share_diff,
        config.extranonce_size
    );

    run(config).await
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let mut settings = BridgeSettings::new(&config.karlsend_address, config.block_wait_time);
    settings.reconnect_backoff = config.reconnect_backoff;
    settings.reconnect_jitter = config.reconnect_jitter;

    let bridge = UpstreamBridge::connect(
        settings,
        Arc::new(HttpNodeConnector::new(config.rpc_timeout)),
        Arc::new(NetworkStats::new(config.print_stats)),
    )
    .await
    .with_context(|| format!("failed to connect to karlsend at {}", config.karlsend_address))?;

    if let Some(addr) = config.health_check_addr()? {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, cancel).await {
                error!("health check server failed: {}", e);
            }
        });
    }

    // the submit slot keeps its default until a share handler is registered
    let dispatcher = MethodDispatcher::new(default_handlers(config.network()));
    let listener = StratumListener::new(
        ListenerConfig {
            min_share_diff: config.min_share_diff,
            ..Default::default()
        },
        dispatcher,
        ExtranonceAllocator::new(config.extranonce_size),
        Arc::clone(&bridge) as Arc<dyn TemplateSource>,
    );

    let bridge_tasks = bridge.start(cancel.clone(), listener.job_notifier()).await;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let result = listener
        .listen(&config.stratum_addr()?.to_string(), cancel.clone())
        .await;

    cancel.cancel();
    for task in bridge_tasks {
        if let Err(e) = task.await {
            error!("bridge task failed: {}", e);
        }
    }

    result.map_err(Into::into)
}

/// Print the effective configuration as YAML
fn print_configuration(config: &BridgeConfig) -> anyhow::Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}
