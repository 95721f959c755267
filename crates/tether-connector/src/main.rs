//! `Tether` Connector
//!
//! Keeps an outbound channel to the cloud open and relays the requests it
//! receives to a local HTTP service.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use tether_connector::local::{LocalClientConfig, LocalServiceClient};
use tether_connector::tunnel::{
    ChannelConfig, ReconnectPolicy, RelayRouter, SessionSupervisor, WsConnector,
};
use tether_core::config::{load_config, resolve_config_path};
use tether_core::{CredentialProvider, FileCredentialProvider};

#[derive(Parser, Debug)]
#[command(name = "tether-connector")]
#[command(version, about = "Tether connector - relays cloud requests to a local HTTP service")]
struct Args {
    /// Connector config file (default: <config dir>/tether/connector.json)
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn"); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "TETHER_LOG_JSON")]
    log_json: bool,

    /// Probe the local service once and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.log_json {
        config.logging.json = true;
    }
    tether_core::tracing_init::init_tracing(&["tether_connector", "tether_core"], &config.logging);

    // Both the WebSocket client and reqwest run on rustls without a bundled provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let credentials: Arc<dyn CredentialProvider> = Arc::new(FileCredentialProvider::new(
        resolve_config_path(args.config.as_deref()),
        config.local.clone(),
    ));
    let local = Arc::new(LocalServiceClient::new(
        LocalClientConfig::from_config(&config.local),
        credentials,
    )?);

    if args.check {
        return match local.probe().await {
            Ok(status) => {
                info!(url = %local.base_url(), status, "Local service is reachable");
                Ok(())
            }
            Err(e) => {
                error!(url = %local.base_url(), error = %e, "Local service check failed");
                Err(e.into())
            }
        };
    }

    let identity = config.require_identity()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        connector_id = %identity.connector_id,
        cloud_url = %config.cloud.url,
        local_url = %config.local.url,
        "Starting tether-connector"
    );

    if let Err(e) = local.probe().await {
        warn!(error = %e, "Local service is not reachable yet; requests will fail until it is");
    }

    let supervisor = SessionSupervisor::new(
        identity,
        WsConnector::new(ChannelConfig::from_cloud(&config.cloud)),
        RelayRouter::new(Arc::clone(&local), config.local.health_path.clone()),
        ReconnectPolicy::from_config(&config.reconnect),
    );
    supervisor.start()?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    supervisor.stop().await;
    info!("Connector stopped");
    Ok(())
}
