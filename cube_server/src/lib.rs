//! `cube_server`
//!
//! Reference authoritative server for the cube replication protocol:
//! - Assigns player ids and colors
//! - Receives `PlayerUpdate`s
//! - Broadcasts `ServerUpdate`s at a fixed rate
//!
//! Networking model: one TCP stream per client, length-prefixed JSON frames.

pub mod server;

pub use server::GameServer;
