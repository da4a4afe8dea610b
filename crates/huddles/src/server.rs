use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::registry::Registry;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shared state for the relay server.
pub struct ServerState {
    /// Participant registry for the single room this relay serves.
    pub registry: Arc<Registry>,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Atomic counter for active admitted connections.
    pub active_connections: AtomicUsize,
    /// Source of per-connection ids, used to tell a superseded connection apart
    /// from the one that currently owns a participant entry.
    pub next_conn_id: AtomicU64,
}

impl ServerState {
    /// Build state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new(config.grace_period())),
            config,
            active_connections: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
        }
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    let (shutdown_tx, _) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_tx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// When `shutdown_tx` fires, the loop stops accepting, drops every registry
/// entry so live connections close, and waits for them to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_tx: tokio::sync::watch::Sender<()>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr().map_err(RelayError::Io)?;
    info!("relay listening on {}", local_addr);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    warn!("connection task ended abnormally: {}", e);
                }
            }
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", connections.len());
                break;
            }
        }
    }

    state.registry.clear();

    let drain_timeout = std::time::Duration::from_secs(30);
    let drained = tokio::time::timeout(drain_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            connections.len()
        );
        connections.shutdown().await;
    }

    info!("relay shut down gracefully");
    Ok(())
}
