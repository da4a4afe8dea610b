#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use huddles::config::{Args, ServerConfig};
use huddles::error::RelayError;
use huddles::metrics::{start_metrics_server, HealthState};
use huddles::server::ServerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "huddles=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|source| RelayError::Bind {
            addr: config.listen,
            source,
        })?;
    info!(
        "bound to {} (grace period {} ms)",
        config.listen, config.grace_period_ms
    );

    let state = Arc::new(ServerState::new(config));
    let health_state = HealthState::new(Arc::clone(&state.registry));
    tokio::spawn({
        let health_state = health_state.clone();
        let metrics_addr = state.config.metrics_addr;
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let (shutdown_tx, _) = tokio::sync::watch::channel(());
    let server = huddles::run_with_shutdown(listener, Arc::clone(&state), shutdown_tx.clone());
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            health_state.start_draining();
            let _ = shutdown_tx.send(());
            if let Err(e) = server.await {
                tracing::error!("server error during drain: {}", e);
            }
        }
    }

    Ok(())
}
