//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p cube_client -- [--config client.json] [--ip 127.0.0.1] [--port 40000] [--tick-hz 60]
//!
//! Connects to the server, moves the local cube in a slow circle (standing in
//! for player input) and logs the replicated world now and then. Exits when
//! the server drops the connection.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use cube_client::connection::ConnectionState;
use cube_client::sink::HeadlessSink;
use cube_client::NetworkClient;
use cube_shared::config::ClientConfig;
use cube_shared::math::Vec3;
use tokio::time::Instant;
use tracing::info;

fn parse_args() -> anyhow::Result<ClientConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => ClientConfig::load(&PathBuf::from(&args[i + 1]))?,
        _ => ClientConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--ip" if i + 1 < args.len() => {
                cfg.server_ip = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.server_port = args[i + 1].parse().context("parse --port")?;
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    let tick_interval = Duration::from_secs_f32(1.0 / cfg.tick_hz.max(1) as f32);
    let sink = HeadlessSink::new(cfg.player_prefab.clone());

    let mut client = NetworkClient::new(cfg, sink, tokio::runtime::Handle::current());
    let server = client.init().context("connect")?;
    info!(%server, "Client started");

    let start = Instant::now();
    let mut last = start;
    let mut frame: u64 = 0;

    loop {
        let now = Instant::now();
        let dt = now - last;
        last = now;

        let t = (now - start).as_secs_f32();
        client
            .sink_mut()
            .set_local_position(Vec3::new(t.cos() * 2.0, 0.0, t.sin() * 2.0));

        client.tick(dt);

        if client.state() == ConnectionState::Disconnected {
            info!("Disconnected from server.");
            break;
        }

        frame += 1;
        if frame % 300 == 0 {
            let stats = client.stats();
            info!(
                local = ?client.local().map(|l| l.id().to_string()),
                remote = client.registry().len(),
                received = stats.received,
                dropped = stats.dropped,
                reports = stats.reports_sent,
                "Status"
            );
        }

        tokio::time::sleep(tick_interval).await;
    }

    client.shutdown();
    Ok(())
}
