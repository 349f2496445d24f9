//! Connection management.
//!
//! The manager owns a single outbound connection and exposes it to the tick
//! thread as a poll-driven event stream:
//!
//! ```text
//! Idle --connect()--> Connecting --Connected--> Connected --Disconnected / disconnect()--> Disconnected
//! ```
//!
//! Socket I/O runs on a driver task spawned on the Tokio runtime handed to
//! [`ConnectionManager::new`]. The task only moves frames; every state change
//! happens inside [`ConnectionManager::poll`] on the caller's thread.
//! A disconnected manager is never reused.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use cube_shared::net::{read_frame, write_frame};
use tokio::{
    net::TcpStream,
    runtime::Handle,
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connect attempt yet.
    Idle,
    /// Connect attempt in flight.
    Connecting,
    /// Transport reported the connection as established.
    Connected,
    /// Closed by the peer, by a transport failure or by `disconnect()`.
    Disconnected,
}

/// Transport event delivered by [`ConnectionManager::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// One inbound message blob.
    Data(Bytes),
    Disconnected,
}

/// Connection errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Host/port do not form a usable socket address.
    InvalidEndpoint(String),
    /// Sending requires the `Connected` state.
    NotConnected,
    /// `connect()` is only valid from `Idle`.
    AlreadyStarted(ConnectionState),
    /// The transport was already released by `shutdown()`.
    ShutDown,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::InvalidEndpoint(ep) => write!(f, "invalid endpoint: {}", ep),
            ConnectionError::NotConnected => write!(f, "not connected"),
            ConnectionError::AlreadyStarted(state) => {
                write!(f, "connection already started (state {:?})", state)
            }
            ConnectionError::ShutDown => write!(f, "transport has been shut down"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Tick-side half of one connection attempt.
struct Link {
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    outbound: mpsc::UnboundedSender<Bytes>,
    driver: Option<JoinHandle<()>>,
}

/// Owns one outbound connection and its lifecycle state.
pub struct ConnectionManager {
    state: ConnectionState,
    link: Option<Link>,
    /// Present until `shutdown()` releases the transport.
    runtime: Option<Handle>,
}

impl ConnectionManager {
    /// Creates an idle manager that will run its I/O on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            state: ConnectionState::Idle,
            link: None,
            runtime: Some(runtime),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Starts connecting to `host:port`. `host` must be an IP literal.
    ///
    /// Returns immediately; completion is reported by a later `poll()`.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<SocketAddr, ConnectionError> {
        let runtime = self.runtime.as_ref().ok_or(ConnectionError::ShutDown)?;
        if self.state != ConnectionState::Idle {
            return Err(ConnectionError::AlreadyStarted(self.state));
        }

        let addr = parse_endpoint(host, port)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let driver = runtime.spawn(drive(addr, events_tx, outbound_rx));

        self.link = Some(Link {
            events: events_rx,
            outbound: outbound_tx,
            driver: Some(driver),
        });
        self.state = ConnectionState::Connecting;
        info!(server = %addr, "Connecting to server");
        Ok(addr)
    }

    /// Drains every event the transport has buffered, in delivery order.
    ///
    /// Never blocks. A `Disconnected` event ends the batch and releases the
    /// connection; anything queued behind it is discarded.
    pub fn poll(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        let mut closed = false;

        if let Some(link) = self.link.as_mut() {
            loop {
                match link.events.try_recv() {
                    Ok(ConnectionEvent::Connected) => {
                        debug!("Transport connected");
                        self.state = ConnectionState::Connected;
                        events.push(ConnectionEvent::Connected);
                    }
                    Ok(ConnectionEvent::Disconnected) | Err(TryRecvError::Disconnected) => {
                        debug!("Transport disconnected");
                        closed = true;
                        events.push(ConnectionEvent::Disconnected);
                        break;
                    }
                    Ok(data) => events.push(data),
                    Err(TryRecvError::Empty) => break,
                }
            }
        }

        if closed {
            self.state = ConnectionState::Disconnected;
            self.link = None;
        }
        events
    }

    /// Queues one message blob for the server.
    pub fn send(&mut self, bytes: Bytes) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let link = self.link.as_ref().ok_or(ConnectionError::NotConnected)?;
        link.outbound
            .send(bytes)
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Closes the connection. Frames already queued are still flushed.
    /// Calling it again is a no-op.
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            info!("Disconnecting from server");
        }
        self.state = ConnectionState::Disconnected;
        // Dropping the sender ends the writer, which closes the socket.
        self.link = None;
    }

    /// Releases the transport. Runs once; later calls are no-ops.
    pub fn shutdown(&mut self) {
        let Some(_runtime) = self.runtime.take() else {
            return;
        };
        if let Some(driver) = self.link.take().and_then(|link| link.driver) {
            driver.abort();
        }
        self.state = ConnectionState::Disconnected;
        debug!("Transport shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.is_none()
    }

    /// Builds a manager already in `Connecting` whose transport side is
    /// driven by hand.
    #[cfg(test)]
    pub(crate) fn scripted(
        runtime: Handle,
    ) -> (
        Self,
        mpsc::UnboundedSender<ConnectionEvent>,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let manager = Self {
            state: ConnectionState::Connecting,
            link: Some(Link {
                events: events_rx,
                outbound: outbound_tx,
                driver: None,
            }),
            runtime: Some(runtime),
        };
        (manager, events_tx, outbound_rx)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_endpoint(host: &str, port: u16) -> Result<SocketAddr, ConnectionError> {
    let invalid = || ConnectionError::InvalidEndpoint(format!("{}:{}", host, port));
    let ip: IpAddr = host.trim().parse().map_err(|_| invalid())?;
    if port == 0 || ip.is_unspecified() {
        return Err(invalid());
    }
    Ok(SocketAddr::new(ip, port))
}

/// Connects, then pumps frames both ways until either side ends.
async fn drive(
    addr: SocketAddr,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(server = %addr, error = %e, "Connect failed");
            let _ = events.send(ConnectionEvent::Disconnected);
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    if events.send(ConnectionEvent::Connected).is_err() {
        return;
    }

    let (mut rd, mut wr) = stream.into_split();
    let reader = async {
        loop {
            match read_frame(&mut rd).await {
                Ok(Some(frame)) => {
                    if events.send(ConnectionEvent::Data(frame)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Read failed");
                    break;
                }
            }
        }
    };
    let writer = async {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = write_frame(&mut wr, &frame).await {
                warn!(error = %e, "Write failed");
                break;
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = writer => {}
    }
    let _ = events.send(ConnectionEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    async fn poll_until<F>(manager: &mut ConnectionManager, mut done: F) -> Vec<ConnectionEvent>
    where
        F: FnMut(&[ConnectionEvent]) -> bool,
    {
        let mut seen = Vec::new();
        for _ in 0..200 {
            seen.extend(manager.poll());
            if done(&seen) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seen
    }

    #[tokio::test]
    async fn rejects_invalid_endpoints() {
        let mut manager = ConnectionManager::new(Handle::current());
        for (host, port) in [("not-an-ip", 4000), ("127.0.0.1", 0), ("0.0.0.0", 4000)] {
            assert!(matches!(
                manager.connect(host, port),
                Err(ConnectionError::InvalidEndpoint(_))
            ));
        }
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.poll().is_empty());
    }

    #[tokio::test]
    async fn send_requires_connected() {
        let (mut manager, events, _outbound) = ConnectionManager::scripted(Handle::current());
        assert_eq!(
            manager.send(Bytes::from_static(b"x")),
            Err(ConnectionError::NotConnected)
        );
        events.send(ConnectionEvent::Connected).unwrap();
        manager.poll();
        assert!(manager.send(Bytes::from_static(b"x")).is_ok());
    }

    #[tokio::test]
    async fn poll_drains_in_delivery_order() {
        let (mut manager, events, mut outbound) = ConnectionManager::scripted(Handle::current());
        events.send(ConnectionEvent::Connected).unwrap();
        events.send(ConnectionEvent::Data(Bytes::from_static(b"a"))).unwrap();
        events.send(ConnectionEvent::Data(Bytes::from_static(b"b"))).unwrap();

        assert_eq!(
            manager.poll(),
            vec![
                ConnectionEvent::Connected,
                ConnectionEvent::Data(Bytes::from_static(b"a")),
                ConnectionEvent::Data(Bytes::from_static(b"b")),
            ]
        );
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.poll().is_empty());

        manager.send(Bytes::from_static(b"up")).unwrap();
        assert_eq!(outbound.try_recv().unwrap(), Bytes::from_static(b"up"));
    }

    #[tokio::test]
    async fn disconnect_event_ends_the_batch() {
        let (mut manager, events, _outbound) = ConnectionManager::scripted(Handle::current());
        events.send(ConnectionEvent::Connected).unwrap();
        events.send(ConnectionEvent::Disconnected).unwrap();
        events.send(ConnectionEvent::Data(Bytes::from_static(b"late"))).ok();

        assert_eq!(
            manager.poll(),
            vec![ConnectionEvent::Connected, ConnectionEvent::Disconnected]
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.poll().is_empty());
        assert_eq!(
            manager.send(Bytes::from_static(b"x")),
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_final() {
        let (mut manager, events, _outbound) = ConnectionManager::scripted(Handle::current());
        events.send(ConnectionEvent::Connected).unwrap();
        manager.poll();

        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            manager.connect("127.0.0.1", 4000),
            Err(ConnectionError::AlreadyStarted(ConnectionState::Disconnected))
        );
    }

    #[tokio::test]
    async fn shutdown_runs_once() {
        let mut manager = ConnectionManager::new(Handle::current());
        manager.shutdown();
        assert!(manager.is_shut_down());
        manager.shutdown();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            manager.connect("127.0.0.1", 4000),
            Err(ConnectionError::ShutDown)
        );
    }

    #[tokio::test]
    async fn talks_to_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut manager = ConnectionManager::new(Handle::current());
        manager.connect("127.0.0.1", port).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let (mut peer, _) = listener.accept().await.unwrap();
        let seen = poll_until(&mut manager, |ev| ev.contains(&ConnectionEvent::Connected)).await;
        assert_eq!(seen, vec![ConnectionEvent::Connected]);

        write_frame(&mut peer, b"{\"cmd\":0}").await.unwrap();
        manager.send(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(
            read_frame(&mut peer).await.unwrap().as_deref(),
            Some(&b"ping"[..])
        );

        drop(peer);
        let seen = poll_until(&mut manager, |ev| ev.contains(&ConnectionEvent::Disconnected)).await;
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::Data(Bytes::from_static(b"{\"cmd\":0}")),
                ConnectionEvent::Disconnected,
            ]
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn dropping_a_connected_manager_closes_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut manager = ConnectionManager::new(Handle::current());
        manager.connect("127.0.0.1", port).unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        poll_until(&mut manager, |ev| ev.contains(&ConnectionEvent::Connected)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        drop(manager);
        let eof = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut peer))
            .await
            .expect("socket still open after drop");
        assert_eq!(eof.unwrap(), None);
    }

    #[tokio::test]
    async fn refused_connect_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut manager = ConnectionManager::new(Handle::current());
        manager.connect("127.0.0.1", port).unwrap();
        let seen = poll_until(&mut manager, |ev| !ev.is_empty()).await;
        assert_eq!(seen, vec![ConnectionEvent::Disconnected]);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
