mod failover;
mod handlers;
mod state;

use crate::state::AppState;
use anyhow::{Context, Result};
use common::MetricCatalog;
use std::env;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const FAILOVER_SWEEP_INTERVAL_SECS: u64 = 5;

/// Veces que una invocación puede entregarse a un worker antes de darla
/// por fallida (sólo cuenta re-entregas por caída de worker).
pub const MAX_DELIVERIES: u32 = 3;

fn bind_addr() -> String {
    env::var("MASTER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,common=info,tower_http=info,axum=info")),
        )
        .init();

    let state = AppState::new(MetricCatalog::builtin());

    // router HTTP
    let app = handlers::build_router(state.clone());

    // detección de workers caídos en segundo plano
    let failover_state = state.clone();
    tokio::spawn(async move {
        failover::run_failover_loop(failover_state).await;
    });

    let addr = bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
