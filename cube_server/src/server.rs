//! Server implementation.
//!
//! A small authoritative server for the cube replication protocol:
//! - Accepts TCP clients and assigns each an id (`p1`, `p2`, ...) and a color
//! - Greets with `Handshake`, then `SpawnedPlayers` for everyone already here
//! - Announces newcomers to existing clients with `NewPlayer`
//! - Takes positions from `PlayerUpdate`; colors stay server owned
//! - Broadcasts a `ServerUpdate` with every player each step
//!
//! Each client has a reader task that forwards frames to the server inbox.
//! All player state is touched only from `step()` and `try_accept()`.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use cube_shared::{
    config::ServerConfig,
    math::{Color, Vec3},
    net::{decode_message, encode, read_frame, write_frame, EntityId, EntitySnapshot, Message},
};
use rand::Rng;
use tokio::{
    io::AsyncWrite,
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

/// Frame or close notice from a client's reader task.
#[derive(Debug)]
enum Inbound {
    Frame(EntityId, Bytes),
    Closed(EntityId),
}

/// Connected player.
struct Player {
    snapshot: EntitySnapshot,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl Drop for Player {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Game server.
pub struct GameServer {
    pub cfg: ServerConfig,
    listener: TcpListener,
    /// Ordered so broadcasts list players in a stable order.
    players: BTreeMap<EntityId, Player>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,
    next_id: u32,
    tick: u64,
}

impl GameServer {
    /// Binds the listener from the config.
    pub async fn bind(cfg: ServerConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.bind_addr.parse().context("parse bind_addr")?;
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(Self {
            cfg,
            listener,
            players: BTreeMap::new(),
            inbox_tx,
            inbox_rx,
            next_id: 1,
            tick: 0,
        })
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Snapshots of all connected players, ordered by id.
    pub fn players(&self) -> Vec<EntitySnapshot> {
        self.players.values().map(|p| p.snapshot.clone()).collect()
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Waits up to `timeout` for one client and greets it.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<EntityId>> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => self.handle_new_connection(stream, peer).await.map(Some),
            Ok(Err(e)) => Err(e).context("tcp accept"),
            Err(_) => Ok(None),
        }
    }

    /// Accepts exactly one client.
    pub async fn accept_one(&mut self) -> anyhow::Result<EntityId> {
        let (stream, peer) = self.listener.accept().await.context("tcp accept")?;
        self.handle_new_connection(stream, peer).await
    }

    async fn handle_new_connection(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> anyhow::Result<EntityId> {
        stream.set_nodelay(true).context("set_nodelay")?;
        let id = EntityId::new(format!("p{}", self.next_id));
        self.next_id += 1;

        let snapshot = EntitySnapshot {
            id: id.clone(),
            position: Vec3::ZERO,
            color: random_color(),
        };

        let limit = self.cfg.send_timeout();
        let (mut rd, mut writer) = stream.into_split();
        send_to(&mut writer, &Message::handshake(id.as_str()), limit).await?;
        send_to(&mut writer, &Message::spawned_players(self.players()), limit).await?;
        self.broadcast(&Message::new_player(snapshot.clone())).await;

        let inbox = self.inbox_tx.clone();
        let reader_id = id.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut rd).await {
                    Ok(Some(frame)) => {
                        if inbox.send(Inbound::Frame(reader_id.clone(), frame)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(id = %reader_id, error = %e, "Client read failed");
                        break;
                    }
                }
            }
            let _ = inbox.send(Inbound::Closed(reader_id));
        });

        self.players.insert(
            id.clone(),
            Player {
                snapshot,
                writer,
                reader,
            },
        );
        info!(id = %id, %peer, players = self.players.len(), "Client connected");
        Ok(id)
    }

    /// Runs the server for a number of steps at `update_hz`.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(1.0 / self.cfg.update_hz.max(1) as f32);
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Applies everything clients sent since the last step, then broadcasts.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        while let Ok(inbound) = self.inbox_rx.try_recv() {
            match inbound {
                Inbound::Frame(from, frame) => self.on_frame(&from, &frame),
                Inbound::Closed(id) => {
                    if self.players.remove(&id).is_some() {
                        info!(id = %id, "Client disconnected");
                    }
                }
            }
        }

        if !self.players.is_empty() {
            self.broadcast(&Message::server_update(self.players())).await;
        }
        self.tick += 1;
        Ok(())
    }

    fn on_frame(&mut self, from: &EntityId, frame: &[u8]) {
        let msg = match decode_message(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(id = %from, error = %e, "Dropping bad client message");
                return;
            }
        };
        match msg {
            Message::PlayerUpdate(pu) if &pu.player.id == from => {
                if let Some(player) = self.players.get_mut(from) {
                    player.snapshot.position = pu.player.position;
                }
            }
            Message::PlayerUpdate(pu) => {
                debug!(id = %from, claimed = %pu.player.id, "Player update for another id ignored");
            }
            other => {
                debug!(id = %from, cmd = ?other.command(), "Unexpected client message");
            }
        }
    }

    /// Sends to every player; players whose socket fails or stalls are dropped.
    async fn broadcast(&mut self, msg: &Message) {
        let bytes = match encode(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode broadcast");
                return;
            }
        };
        let limit = self.cfg.send_timeout();
        let mut failed = Vec::new();
        for (id, player) in self.players.iter_mut() {
            if let Err(e) = write_within(&mut player.writer, &bytes, limit).await {
                warn!(id = %id, error = %e, "Send failed, dropping client");
                failed.push(id.clone());
            }
        }
        for id in failed {
            self.players.remove(&id);
        }
    }
}

async fn send_to(
    writer: &mut OwnedWriteHalf,
    msg: &Message,
    limit: Duration,
) -> anyhow::Result<()> {
    let bytes = encode(msg).context("encode")?;
    write_within(writer, &bytes, limit).await
}

/// Writes one frame, giving up after `limit`.
async fn write_within<W>(writer: &mut W, payload: &[u8], limit: Duration) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, write_frame(writer, payload))
        .await
        .map_err(|_| anyhow::anyhow!("send timed out after {:?}", limit))?
}

fn random_color() -> Color {
    let mut rng = rand::thread_rng();
    Color::rgb(rng.gen(), rng.gen(), rng.gen())
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(update_hz: u32) -> anyhow::Result<(GameServer, ServerConfig)> {
    let cfg = ServerConfig {
        bind_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        update_hz,
        ..ServerConfig::default()
    };
    let mut server = GameServer::bind(cfg).await?;
    let addr = server.local_addr()?;
    server.cfg.bind_addr = addr.to_string();
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_msg(stream: &mut TcpStream) -> Message {
        let frame = read_frame(stream).await.unwrap().unwrap();
        decode_message(&frame).unwrap()
    }

    #[tokio::test]
    async fn greets_and_announces_players() {
        let (mut server, cfg) = bind_ephemeral(30).await.unwrap();

        let mut a = TcpStream::connect(&cfg.bind_addr).await.unwrap();
        let id_a = server.accept_one().await.unwrap();
        assert_eq!(read_msg(&mut a).await, Message::handshake("p1"));
        assert_eq!(read_msg(&mut a).await, Message::spawned_players(vec![]));

        let mut b = TcpStream::connect(&cfg.bind_addr).await.unwrap();
        server.accept_one().await.unwrap();
        assert_eq!(read_msg(&mut b).await, Message::handshake("p2"));
        match read_msg(&mut b).await {
            Message::SpawnedPlayers(sp) => {
                assert_eq!(sp.players.len(), 1);
                assert_eq!(sp.players[0].id, id_a);
            }
            other => panic!("expected SpawnedPlayers, got {other:?}"),
        }
        match read_msg(&mut a).await {
            Message::NewPlayer(np) => assert_eq!(np.player.id.as_str(), "p2"),
            other => panic!("expected NewPlayer, got {other:?}"),
        }
        assert_eq!(server.player_count(), 2);
    }

    #[tokio::test]
    async fn player_update_moves_but_does_not_recolor() {
        let (mut server, cfg) = bind_ephemeral(30).await.unwrap();
        let mut a = TcpStream::connect(&cfg.bind_addr).await.unwrap();
        server.accept_one().await.unwrap();
        read_msg(&mut a).await;
        read_msg(&mut a).await;
        let assigned = server.players()[0].color;

        let report = Message::player_update(EntitySnapshot::new(
            "p1",
            Vec3::new(1.0, 2.0, 3.0),
            Color::rgb(0.123, 0.456, 0.789),
        ));
        write_frame(&mut a, &encode(&report).unwrap()).await.unwrap();
        write_frame(&mut a, b"garbage").await.unwrap();

        for _ in 0..100 {
            server.step().await.unwrap();
            if server.players()[0].position != Vec3::ZERO {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let p1 = &server.players()[0];
        assert_eq!(p1.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(p1.color, assigned);

        match read_msg(&mut a).await {
            Message::ServerUpdate(su) => assert_eq!(su.players.len(), 1),
            other => panic!("expected ServerUpdate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_writes_give_up_after_the_limit() {
        let limit = Duration::from_millis(20);

        // Nobody reads `_stalled`, so the 16 byte pipe fills up.
        let (mut tx, _stalled) = tokio::io::duplex(16);
        let err = write_within(&mut tx, &[7u8; 64], limit).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");

        let (mut tx, mut rx) = tokio::io::duplex(1024);
        write_within(&mut tx, b"fits", limit).await.unwrap();
        assert_eq!(read_frame(&mut rx).await.unwrap().as_deref(), Some(&b"fits"[..]));
    }

    #[tokio::test]
    async fn closed_client_is_removed() {
        let (mut server, cfg) = bind_ephemeral(30).await.unwrap();
        let a = TcpStream::connect(&cfg.bind_addr).await.unwrap();
        server.accept_one().await.unwrap();
        drop(a);

        for _ in 0..100 {
            server.step().await.unwrap();
            if server.player_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.player_count(), 0);
    }
}
