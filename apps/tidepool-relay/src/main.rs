use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use tidepool_relay::{
    cli::{self, Cli, Commands},
    config::RelayConfig,
    telemetry::Telemetry,
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let mut cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        id,
        watch,
        start_streaming,
        seconds,
    }) = cli.command.take()
    {
        return cli::run_probe(url, id, watch, start_streaming, seconds).await;
    }

    let mut config = RelayConfig::from_env();
    cli.apply(&mut config);
    let listen_addr = config.listen_addr();
    info!(
        listen_addr = %listen_addr,
        ping_interval_secs = config.ping_interval.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "starting tidepool relay"
    );

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    let state = AppState::new(config).with_metrics(telemetry.metrics_handle());

    tidepool_relay::serve(listener, state, shutdown_signal()).await?;
    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
