//! Wire protocol.
//!
//! Every message is a single JSON object carrying an integer `cmd`
//! discriminator next to the payload fields:
//!
//! ```text
//! {"cmd":2,"players":[{"id":"p1","position":{..},"color":{..}}]}
//! ```
//!
//! Decoding happens in two passes over the same bytes: [`decode_header`]
//! reads only `cmd`, then [`decode`] parses the payload selected by it.
//! Unknown discriminators survive the first pass and are rejected by the
//! second one.
//!
//! On the stream each message travels as one frame: a big-endian `u32`
//! length followed by the JSON text.

use std::{fmt, io};

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::math::{Color, Vec3};

/// Largest frame accepted on the stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Identifies an entity (a player avatar). Assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

/// Replicated state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub position: Vec3,
    pub color: Color,
}

impl EntitySnapshot {
    pub fn new(id: impl Into<String>, position: Vec3, color: Color) -> Self {
        Self {
            id: EntityId::new(id),
            position,
            color,
        }
    }
}

/// Command discriminator carried in the `cmd` field.
///
/// Values outside the known range decode as [`Command::Unknown`] so the
/// envelope still parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Command {
    Handshake,
    PlayerUpdate,
    ServerUpdate,
    SpawnedPlayers,
    NewPlayer,
    Unknown(i64),
}

impl From<i64> for Command {
    fn from(v: i64) -> Self {
        match v {
            0 => Command::Handshake,
            1 => Command::PlayerUpdate,
            2 => Command::ServerUpdate,
            3 => Command::SpawnedPlayers,
            4 => Command::NewPlayer,
            other => Command::Unknown(other),
        }
    }
}

impl From<Command> for i64 {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Handshake => 0,
            Command::PlayerUpdate => 1,
            Command::ServerUpdate => 2,
            Command::SpawnedPlayers => 3,
            Command::NewPlayer => 4,
            Command::Unknown(other) => other,
        }
    }
}

/// First-pass view of a message: only the discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Header {
    pub cmd: Command,
}

/// Reference to a player by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub id: EntityId,
}

/// Server -> client: the id assigned to this client's player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeMsg {
    pub player: PlayerRef,
}

/// Client -> server: state of the locally controlled player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerUpdateMsg {
    pub player: EntitySnapshot,
}

/// Server -> client: periodic state of every player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUpdateMsg {
    pub players: Vec<EntitySnapshot>,
}

/// Server -> client: players already present when this client joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnedPlayersMsg {
    pub players: Vec<EntitySnapshot>,
}

/// Server -> client: a player joined after this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlayerMsg {
    pub player: EntitySnapshot,
}

/// Fully decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakeMsg),
    PlayerUpdate(PlayerUpdateMsg),
    ServerUpdate(ServerUpdateMsg),
    SpawnedPlayers(SpawnedPlayersMsg),
    NewPlayer(NewPlayerMsg),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Handshake(_) => Command::Handshake,
            Message::PlayerUpdate(_) => Command::PlayerUpdate,
            Message::ServerUpdate(_) => Command::ServerUpdate,
            Message::SpawnedPlayers(_) => Command::SpawnedPlayers,
            Message::NewPlayer(_) => Command::NewPlayer,
        }
    }

    pub fn handshake(id: impl Into<String>) -> Self {
        Message::Handshake(HandshakeMsg {
            player: PlayerRef {
                id: EntityId::new(id),
            },
        })
    }

    pub fn player_update(player: EntitySnapshot) -> Self {
        Message::PlayerUpdate(PlayerUpdateMsg { player })
    }

    pub fn server_update(players: Vec<EntitySnapshot>) -> Self {
        Message::ServerUpdate(ServerUpdateMsg { players })
    }

    pub fn spawned_players(players: Vec<EntitySnapshot>) -> Self {
        Message::SpawnedPlayers(SpawnedPlayersMsg { players })
    }

    pub fn new_player(player: EntitySnapshot) -> Self {
        Message::NewPlayer(NewPlayerMsg { player })
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The bytes are not a valid envelope or payload.
    Malformed(String),
    /// The envelope parsed but no payload is defined for its `cmd`.
    UnknownCommand(i64),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Malformed(reason) => write!(f, "malformed message: {}", reason),
            CodecError::UnknownCommand(cmd) => write!(f, "unknown command {}", cmd),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Malformed(e.to_string())
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    cmd: Command,
    #[serde(flatten)]
    body: &'a T,
}

fn encode_body<T: Serialize>(cmd: Command, body: &T) -> Result<Bytes, CodecError> {
    let payload = serde_json::to_vec(&Envelope { cmd, body })?;
    Ok(Bytes::from(payload))
}

/// Encodes a message as one JSON blob.
pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
    let cmd = msg.command();
    match msg {
        Message::Handshake(m) => encode_body(cmd, m),
        Message::PlayerUpdate(m) => encode_body(cmd, m),
        Message::ServerUpdate(m) => encode_body(cmd, m),
        Message::SpawnedPlayers(m) => encode_body(cmd, m),
        Message::NewPlayer(m) => encode_body(cmd, m),
    }
}

/// First pass: reads only the `cmd` field.
pub fn decode_header(bytes: &[u8]) -> Result<Header, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Second pass: parses the payload selected by `cmd` from the same bytes.
pub fn decode(bytes: &[u8], cmd: Command) -> Result<Message, CodecError> {
    let msg = match cmd {
        Command::Handshake => Message::Handshake(serde_json::from_slice(bytes)?),
        Command::PlayerUpdate => Message::PlayerUpdate(serde_json::from_slice(bytes)?),
        Command::ServerUpdate => Message::ServerUpdate(serde_json::from_slice(bytes)?),
        Command::SpawnedPlayers => Message::SpawnedPlayers(serde_json::from_slice(bytes)?),
        Command::NewPlayer => Message::NewPlayer(serde_json::from_slice(bytes)?),
        Command::Unknown(other) => return Err(CodecError::UnknownCommand(other)),
    };
    Ok(msg)
}

/// Runs both decode passes.
pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    let header = decode_header(bytes)?;
    decode(bytes, header.cmd)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        anyhow::bail!("frame of {} bytes exceeds {}", payload.len(), MAX_FRAME_LEN);
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await.context("write frame")?;
    Ok(())
}

/// Reads one length-prefixed frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("read frame len"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {} bytes exceeds {}", len, MAX_FRAME_LEN);
    }
    let mut payload = BytesMut::zeroed(len);
    reader
        .read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    Ok(Some(payload.freeze()))
}
