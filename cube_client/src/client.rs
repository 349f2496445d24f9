//! Client implementation.
//!
//! `NetworkClient` is driven by an external loop:
//! - `init()` starts the connection.
//! - `tick(dt)` polls the transport once, handles every event in order, then
//!   checks the report timer once.
//! - `shutdown()` (or drop) releases the transport.
//!
//! A bad message never stops the loop; it is logged, counted and dropped.

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use cube_shared::{
    config::ClientConfig,
    net::{decode, decode_header, encode, CodecError},
};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::{
    connection::{ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState},
    reconcile::{LocalEntityState, Reconciler},
    registry::EntityRegistry,
    reporter::{build_report, StateReporter},
    sink::EntitySink,
};

/// Counters for observing the client from outside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Data events handled.
    pub received: u64,
    /// Messages dropped as malformed or unknown.
    pub dropped: u64,
    pub reports_sent: u64,
    /// Reports that could not be sent, usually because the link is down.
    pub reports_failed: u64,
}

/// Replication client for one server connection.
pub struct NetworkClient<S: EntitySink> {
    cfg: ClientConfig,
    connection: ConnectionManager,
    reconciler: Reconciler<S::Handle>,
    reporter: StateReporter,
    sink: S,
    stats: ClientStats,
}

impl<S: EntitySink> NetworkClient<S> {
    /// Creates an idle client. Socket I/O will run on `runtime`.
    pub fn new(cfg: ClientConfig, sink: S, runtime: Handle) -> Self {
        Self::with_connection(cfg, sink, ConnectionManager::new(runtime))
    }

    fn with_connection(cfg: ClientConfig, sink: S, connection: ConnectionManager) -> Self {
        let reporter = StateReporter::new(cfg.report_delay(), cfg.report_period());
        Self {
            cfg,
            connection,
            reconciler: Reconciler::new(),
            reporter,
            sink,
            stats: ClientStats::default(),
        }
    }

    /// Starts connecting to the configured server.
    pub fn init(&mut self) -> Result<SocketAddr, ConnectionError> {
        info!(
            ip = %self.cfg.server_ip,
            port = self.cfg.server_port,
            prefab = %self.cfg.player_prefab,
            "Starting client"
        );
        self.connection
            .connect(&self.cfg.server_ip, self.cfg.server_port)
    }

    /// Runs one frame.
    pub fn tick(&mut self, dt: Duration) {
        for event in self.connection.poll() {
            match event {
                ConnectionEvent::Connected => {
                    info!("We are now connected to the server");
                    self.reporter.start();
                }
                ConnectionEvent::Data(bytes) => self.handle_data(&bytes),
                ConnectionEvent::Disconnected => {
                    info!("Client got disconnected from server");
                }
            }
        }

        if self.reporter.advance(dt) {
            self.report_state();
        }
    }

    fn handle_data(&mut self, bytes: &[u8]) {
        self.stats.received += 1;
        let decoded = decode_header(bytes).and_then(|header| decode(bytes, header.cmd));
        match decoded {
            Ok(msg) => {
                trace!(cmd = ?msg.command(), "Message received");
                self.reconciler.apply(&mut self.sink, msg);
            }
            Err(CodecError::UnknownCommand(cmd)) => {
                warn!(cmd, "Unrecognized message received");
                self.stats.dropped += 1;
            }
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "Dropping malformed message");
                self.stats.dropped += 1;
            }
        }
    }

    fn report_state(&mut self) {
        let Some(local) = self.reconciler.sample_local(&mut self.sink) else {
            trace!("No local entity yet, skipping report");
            return;
        };
        let bytes: Bytes = match encode(&build_report(local)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode state report");
                self.stats.reports_failed += 1;
                return;
            }
        };
        match self.connection.send(bytes) {
            Ok(()) => self.stats.reports_sent += 1,
            Err(e) => {
                debug!(error = %e, "State report not sent");
                self.stats.reports_failed += 1;
            }
        }
    }

    /// Closes the connection. Idempotent.
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// Releases the transport. Also runs when the client is dropped.
    pub fn shutdown(&mut self) {
        self.connection.shutdown();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn local(&self) -> Option<&LocalEntityState> {
        self.reconciler.local()
    }

    pub fn registry(&self) -> &EntityRegistry<S::Handle> {
        self.reconciler.registry()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }
}
