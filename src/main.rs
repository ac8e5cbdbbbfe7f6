//! Coplay Coordinator
//!
//! Serves every configured scene over WebSocket until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coplay::{
    env::token_chase_factory,
    network::{CoordinatorServer, ServerConfig},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().context("loading configuration")?;
    info!("Coplay Coordinator v{}", VERSION);
    for scene in &config.scenes {
        info!(
            scene = %scene.scene_id,
            group_size = scene.group_size,
            execution = ?scene.execution,
            fps = scene.fps,
            "Scene loaded"
        );
    }

    let server = Arc::new(CoordinatorServer::new(config, token_chase_factory()));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            signal_server.shutdown();
        }
    });

    server.run().await.context("coordinator server failed")?;
    Ok(())
}
