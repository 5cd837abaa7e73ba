use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

use corvid_core::cluster::LoopbackBus;
use corvid_core::collab::{AllowAll, JwtIdentityValidator, MemoryMessageStore};
use corvid_core::GatewayState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("corvid=info")),
        )
        .init();

    let args = cli::Args::parse();
    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    // Collaborator wiring for a single-node install. Deployments that run
    // auth, authorization and persistence as separate services swap these
    // for RPC-backed implementations of the same traits; a multi-instance
    // fleet replaces the loopback bus with a shared broker.
    let identity = Arc::new(JwtIdentityValidator::new(config.auth.jwt_secret.clone()));
    let checker = Arc::new(AllowAll);
    let store = Arc::new(MemoryMessageStore::new());
    let bus = Arc::new(LoopbackBus::default());

    let state = GatewayState::new(
        config.gateway.to_gateway_config(),
        identity,
        checker,
        store,
        bus,
    );
    state.spawn_maintenance();

    let app = corvid_gateway::gateway_router()
        .route("/healthz", axum::routing::get(healthz))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        address = %config.server.bind_address,
        instance = %state.instance_id,
        "corvid gateway listening"
    );

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.notify_waiters();
        })
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}
