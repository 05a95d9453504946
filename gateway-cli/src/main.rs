//! `gwctl` — launches the MCP gateway: loads configuration, registers
//! upstreams, starts the Broker and the Router, watches the configuration
//! file for changes, and drains both listeners on SIGINT.
//!
//! Everything below is argv, environment, and process lifecycle; the
//! protocol and concurrency logic all lives in `gateway-core`.

mod config_watch;
mod health;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use gateway_core::logging::RequestLoggerLayer;
use gateway_core::proto::external_processor_server::ExternalProcessorServer;
use gateway_core::{register, Broker, ConfigSnapshot, GatewayConfig, Router, SnapshotStore};
use tokio::sync::broadcast;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

/// `gwctl` — run the MCP gateway's Broker and Router from a configuration
/// file.
#[derive(Parser, Debug)]
#[command(name = "gwctl", author, version, about = "MCP gateway control/data-plane launcher")]
struct Args {
    /// Path to the gateway configuration YAML document.
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Address the `/healthz` and `/hello` listener binds to.
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Seconds to wait for in-flight streams to drain after SIGINT.
    #[arg(long, default_value_t = 10)]
    drain_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Config must be readable before logging is configured: the log level
    // itself comes from the document, so a bootstrap filter covers the
    // loader's own diagnostics.
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let config = GatewayConfig::from_file(&args.config)
        .await
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    tracing::info!(log_level = %config.log_level, servers = config.servers.len(), "configuration loaded");

    let servers = config.server_records().context("building server records from configuration")?;
    let snapshot = register(servers, &ConfigSnapshot::empty()).await;

    let store = Arc::new(SnapshotStore::new(snapshot));

    let _watcher =
        config_watch::watch(args.config.clone(), Arc::clone(&store)).context("starting configuration file watcher")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let broker = Broker::new(Arc::clone(&store), config.bind_addr.clone(), config.port);
    let broker_rx = shutdown_tx.subscribe();
    let mut broker_handle =
        tokio::spawn(async move { broker.serve_with_shutdown(broker_rx).await.context("broker listener") });

    let router_addr: SocketAddr =
        config.router_bind_addr.parse().with_context(|| format!("invalid routerBindAddr '{}'", config.router_bind_addr))?;
    let router = Router::new(Arc::clone(&store), "/mcp".to_string());
    let mut router_rx = shutdown_tx.subscribe();
    let mut router_handle = tokio::spawn(async move {
        Server::builder()
            .layer(RequestLoggerLayer)
            .add_service(ExternalProcessorServer::new(router))
            .serve_with_shutdown(router_addr, async move {
                let _ = router_rx.recv().await;
            })
            .await
            .context("router listener")
    });

    let health_rx = shutdown_tx.subscribe();
    let mut health_handle =
        tokio::spawn(async move { health::serve_with_shutdown(args.health_addr, health_rx).await.context("health listener") });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("installing SIGINT handler")?;
            tracing::info!("SIGINT received, starting graceful shutdown");
            let _ = shutdown_tx.send(());
        }
        result = &mut broker_handle => {
            bail!("broker listener exited unexpectedly: {:?}", result);
        }
        result = &mut router_handle => {
            bail!("router listener exited unexpectedly: {:?}", result);
        }
        result = &mut health_handle => {
            bail!("health listener exited unexpectedly: {:?}", result);
        }
    }

    let drain = tokio::time::timeout(Duration::from_secs(args.drain_seconds), async {
        let _ = tokio::join!(broker_handle, router_handle, health_handle);
    });
    if drain.await.is_err() {
        tracing::warn!(drain_seconds = args.drain_seconds, "drain window elapsed before all listeners stopped");
    }

    tracing::info!("gateway stopped");
    Ok(())
}
