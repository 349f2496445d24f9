//! `cube_client`
//!
//! Client-side systems:
//! - Connection management (one TCP link, poll-driven events)
//! - Entity registry for remote players
//! - Reconciliation of server snapshots with the locally controlled entity
//! - Periodic state reports
//! - Entity sink abstraction (rendering stays outside this crate)

pub mod client;
pub mod connection;
pub mod reconcile;
pub mod registry;
pub mod reporter;
pub mod sink;

pub use client::NetworkClient;
