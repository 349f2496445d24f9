//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p cube_server -- [--config server.json] [--addr 127.0.0.1:40000] [--update-hz 30]
//!
//! Accepts clients, assigns each an id and a color, and broadcasts every
//! player's state at the configured rate until interrupted.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use cube_server::GameServer;
use cube_shared::config::ServerConfig;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => ServerConfig::load(&PathBuf::from(&args[i + 1]))?,
        _ => ServerConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.bind_addr = args[i + 1].clone();
                i += 2;
            }
            "--update-hz" if i + 1 < args.len() => {
                cfg.update_hz = args[i + 1].parse().unwrap_or(30);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.bind_addr, update_hz = cfg.update_hz, "Starting server");

    let mut server = GameServer::bind(cfg.clone()).await.context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    let tick_interval = Duration::from_secs_f32(1.0 / cfg.update_hz.max(1) as f32);
    let mut next_tick = tokio::time::Instant::now();

    loop {
        // Accept new clients (non-blocking).
        match server.try_accept(Duration::from_millis(1)).await {
            Ok(Some(id)) => info!(id = %id, "New client accepted"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Accept failed"),
        }

        server.step().await?;

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
