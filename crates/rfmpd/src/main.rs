use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use rfmp_engine::{Config, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rfmp_engine=debug")),
        )
        .init();

    info!("starting rfmpd v{}", env!("CARGO_PKG_VERSION"));

    let config = config_from_env()?;
    info!(
        callsign = %config.node.callsign,
        ssid = config.node.ssid,
        tnc = %format!("{}:{}", config.network.tnc_host, config.network.tnc_port),
        offline = config.network.offline_mode,
        "loaded configuration"
    );

    let engine = Engine::with_defaults(config)?;
    engine.start();

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down");
    engine.shutdown().await?;

    Ok(())
}

/// Assemble the engine configuration from `RFMPD_*` environment variables,
/// starting from defaults. Unparseable values are rejected, not ignored.
fn config_from_env() -> anyhow::Result<Config> {
    let mut config = Config::default();

    if let Ok(callsign) = std::env::var("RFMPD_CALLSIGN") {
        config.node.callsign = callsign;
    }
    if let Ok(ssid) = std::env::var("RFMPD_SSID") {
        config.node.ssid = ssid
            .parse()
            .map_err(|_| anyhow::anyhow!("RFMPD_SSID must be 0-15, got {ssid:?}"))?;
    }
    if let Ok(host) = std::env::var("RFMPD_TNC_HOST") {
        config.network.tnc_host = host;
    }
    if let Ok(port) = std::env::var("RFMPD_TNC_PORT") {
        config.network.tnc_port = port
            .parse()
            .map_err(|_| anyhow::anyhow!("RFMPD_TNC_PORT must be a port, got {port:?}"))?;
    }
    if let Ok(val) = std::env::var("RFMPD_OFFLINE") {
        config.network.offline_mode = val != "false" && val != "0";
    }
    if let Ok(mtu) = std::env::var("RFMPD_MTU") {
        config.protocol.mtu = mtu
            .parse()
            .map_err(|_| anyhow::anyhow!("RFMPD_MTU must be a byte count, got {mtu:?}"))?;
    }
    if let Ok(interval) = std::env::var("RFMPD_SYNC_INTERVAL") {
        config.protocol.sync_interval_s = interval.parse().map_err(|_| {
            anyhow::anyhow!("RFMPD_SYNC_INTERVAL must be seconds, got {interval:?}")
        })?;
    }
    if let Ok(path) = std::env::var("RFMPD_DATABASE") {
        config.storage.database_path = Some(PathBuf::from(path));
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}
