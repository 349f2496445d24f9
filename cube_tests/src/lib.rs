//! Shared harness for the integration tests.
//!
//! Runs the reference server on an ephemeral port in a background task and
//! drives `NetworkClient`s the way a frame loop would.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use cube_client::{sink::HeadlessSink, NetworkClient};
use cube_server::server::{bind_ephemeral, GameServer};
use cube_shared::config::ClientConfig;
use tokio::task::JoinHandle;
use tracing::warn;

/// Simulated frame length used when ticking clients.
pub const FRAME: Duration = Duration::from_millis(5);

/// Upper bound on frames a test waits for a condition.
pub const MAX_FRAMES: usize = 600;

pub type TestClient = NetworkClient<HeadlessSink>;

/// Installs a test-friendly tracing subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Reference server running in the background until [`TestServer::stop`].
pub struct TestServer {
    pub addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<anyhow::Result<GameServer>>,
}

impl TestServer {
    pub async fn start() -> anyhow::Result<Self> {
        let (mut server, _cfg) = bind_ephemeral(100).await?;
        let addr = server.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let running = stop.clone();

        let handle = tokio::spawn(async move {
            while !running.load(Ordering::Relaxed) {
                if let Err(e) = server.try_accept(Duration::from_millis(1)).await {
                    warn!(error = %e, "Accept failed");
                }
                server.step().await?;
                tokio::time::sleep(FRAME).await;
            }
            Ok::<_, anyhow::Error>(server)
        });

        Ok(Self { addr, stop, handle })
    }

    /// Stops the loop and hands the server back for inspection.
    pub async fn stop(self) -> anyhow::Result<GameServer> {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.await?
    }
}

/// Client config pointing at `addr`, reporting every frame.
pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        server_ip: addr.ip().to_string(),
        server_port: addr.port(),
        report_delay_secs: 0.01,
        report_period_secs: FRAME.as_secs_f32(),
        ..ClientConfig::default()
    }
}

/// Creates a headless client and starts connecting.
pub fn connect_client(addr: SocketAddr) -> anyhow::Result<TestClient> {
    let mut client = NetworkClient::new(
        client_config(addr),
        HeadlessSink::new("Cube"),
        tokio::runtime::Handle::current(),
    );
    client.init()?;
    Ok(client)
}

/// Ticks every client once per frame until `done` holds.
///
/// Returns `false` if it never did within [`MAX_FRAMES`].
pub async fn tick_until<F>(clients: &mut [&mut TestClient], mut done: F) -> bool
where
    F: FnMut(&[&mut TestClient]) -> bool,
{
    for _ in 0..MAX_FRAMES {
        for client in clients.iter_mut() {
            client.tick(FRAME);
        }
        if done(clients) {
            return true;
        }
        tokio::time::sleep(FRAME).await;
    }
    false
}
