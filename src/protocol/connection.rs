//! Client-side connection management.
//!
//! A [`Connection`] is one TCP stream to a model server with its send and receive timeouts
//! applied. The [`ConnectionManager`] owns at most one connection and runs a single evaluation
//! step over it, either reusing the stream across steps or connecting anew for each one,
//! depending on its [`ReusePolicy`].
use std::{
    fmt,
    io::{self, ErrorKind},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::config::{RECV_TIMEOUT_KEY, SEND_TIMEOUT_KEY};

use super::{ProtocolTransport, RequestFrame, ResponseFrame, TransportError};

/// Send and receive timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Where a model server listens and how long socket operations may block.
///
/// A timeout of `None` lets the corresponding operation block indefinitely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            send_timeout: Some(DEFAULT_TIMEOUT),
            recv_timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.recv_timeout = timeout;
        self
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Whether a connection outlives the evaluation step that opened it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReusePolicy {
    /// Connect once and keep the stream for every following step.
    #[default]
    Persistent,
    /// Connect at the start of every step and close at its end.
    PerCall,
}

/// An open stream to a model server.
pub struct Connection {
    transport: Option<ProtocolTransport<TcpStream>>,
    peer: String,
}

/// `std` refuses zero-length socket timeouts; report them before any connect is attempted.
fn check_timeout(timeout: Option<Duration>, key: &'static str) -> Result<(), TransportError> {
    if timeout == Some(Duration::ZERO) {
        return Err(TransportError::TimeoutConfig {
            key,
            source: io::Error::new(ErrorKind::InvalidInput, "zero-length timeout"),
        });
    }
    Ok(())
}

impl Connection {
    /// Connects to `endpoint` and applies its timeouts.
    ///
    /// The send timeout also bounds the connect handshake. Nothing here is retried.
    pub fn open(endpoint: &Endpoint) -> Result<Self, TransportError> {
        check_timeout(endpoint.send_timeout, SEND_TIMEOUT_KEY)?;
        check_timeout(endpoint.recv_timeout, RECV_TIMEOUT_KEY)?;

        let peer = endpoint.to_string();
        let connect_failure = |source: io::Error| TransportError::Connect {
            address: peer.clone(),
            source,
        };

        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(connect_failure)?;

        let mut last_error = None;
        let mut stream = None;
        for addr in addrs {
            trace!("connecting to {addr}");
            let attempt = match endpoint.send_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        let stream = match stream {
            Some(stream) => stream,
            None => {
                let source = last_error.unwrap_or_else(|| {
                    io::Error::new(ErrorKind::AddrNotAvailable, "host resolved to no addresses")
                });
                return Err(connect_failure(source));
            }
        };

        stream
            .set_read_timeout(endpoint.recv_timeout)
            .map_err(|source| TransportError::TimeoutConfig {
                key: RECV_TIMEOUT_KEY,
                source,
            })?;
        stream
            .set_write_timeout(endpoint.send_timeout)
            .map_err(|source| TransportError::TimeoutConfig {
                key: SEND_TIMEOUT_KEY,
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to disable Nagle's algorithm for {peer}: {e}");
        }

        info!("connected to {peer}");
        Ok(Self {
            transport: Some(ProtocolTransport::new(stream)),
            peer,
        })
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends one request and waits for its complete response.
    pub fn exchange(&mut self, frame: &RequestFrame) -> Result<ResponseFrame, TransportError> {
        let transport = self.transport.as_mut().ok_or_else(|| {
            TransportError::Send(io::Error::from(ErrorKind::NotConnected))
        })?;

        trace!("{}: sending", self.peer);
        transport.send_request(frame)?;
        trace!("{}: receiving", self.peer);
        transport.recv_response(frame.n_atoms())
    }

    /// Releases the socket. Calling this on a closed connection does nothing.
    pub fn close(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };

        match transport.into_inner().shutdown(Shutdown::Both) {
            Ok(()) => info!("closed connection to {}", self.peer),
            Err(e) if e.kind() == ErrorKind::NotConnected => {
                debug!("connection to {} already closed by peer", self.peer)
            }
            Err(e) => warn!("error closing connection to {}: {e}", self.peer),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Runs evaluation steps against one endpoint.
///
/// A step that fails for any reason closes the connection, so the next step starts from a fresh
/// stream rather than from the middle of an abandoned frame.
#[derive(Debug)]
pub struct ConnectionManager {
    endpoint: Endpoint,
    policy: ReusePolicy,
    connection: Option<Connection>,
}

impl ConnectionManager {
    pub fn new(endpoint: Endpoint, policy: ReusePolicy) -> Self {
        Self {
            endpoint,
            policy,
            connection: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn policy(&self) -> ReusePolicy {
        self.policy
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_open)
    }

    /// Opens the connection ahead of the first step. Only meaningful for
    /// [`ReusePolicy::Persistent`]; per-call managers connect inside every step anyway.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if !self.is_connected() {
            self.connection = Some(Connection::open(&self.endpoint)?);
        }
        Ok(())
    }

    /// Runs one full step: connect if needed, send `frame`, receive the response.
    pub fn evaluate(&mut self, frame: &RequestFrame) -> Result<ResponseFrame, TransportError> {
        let mut connection = match self.connection.take() {
            Some(connection) if connection.is_open() => connection,
            _ => {
                trace!("{}: connecting", self.endpoint);
                Connection::open(&self.endpoint)?
            }
        };

        let result = connection.exchange(frame);

        match (&result, self.policy) {
            (Ok(_), ReusePolicy::Persistent) => self.connection = Some(connection),
            (Ok(_), ReusePolicy::PerCall) => connection.close(),
            (Err(e), _) => {
                warn!("evaluation against {} failed: {e}", self.endpoint);
                connection.close();
            }
        }
        result
    }

    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpListener,
        sync::mpsc,
        thread::{self, JoinHandle},
        time::Instant,
    };

    use super::*;

    fn fake_server<F>(handler: F) -> (Endpoint, JoinHandle<()>)
    where
        F: FnOnce(TcpListener) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        let handle = thread::spawn(move || handler(listener));
        (endpoint, handle)
    }

    fn two_atoms() -> RequestFrame {
        RequestFrame::new(
            vec![0, 1],
            vec![[0.1, 0.1, 0.1], [2.0, -0.2, 0.0]],
            vec![1, 1],
        )
        .unwrap()
    }

    fn generated_frame(n_atoms: usize) -> RequestFrame {
        let species = (0..n_atoms).map(|i| (i % 3) as i32).collect();
        let coordinates = (0..n_atoms)
            .map(|i| {
                let x = i as f64;
                [x * 1.25, -x / 7.0, (x * 0.37).sin()]
            })
            .collect();
        let contributing = (0..n_atoms).map(|i| (i % 2) as i32).collect();
        RequestFrame::new(species, coordinates, contributing).unwrap()
    }

    #[test]
    fn forces_keep_atom_order() {
        let (endpoint, server) = fake_server(|listener| {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(stream);

            let req = transport.read_request().unwrap().unwrap();
            assert_eq!(req, two_atoms());

            let resp = ResponseFrame::new(-3.5, vec![[0.0, 0.0, 0.0], [1.0, -1.0, 0.5]]);
            transport.write_response(&resp).unwrap();
        });

        let mut manager = ConnectionManager::new(endpoint, ReusePolicy::PerCall);
        let resp = manager.evaluate(&two_atoms()).unwrap();

        assert_eq!(resp.energy, -3.5);
        assert_eq!(resp.forces, vec![[0.0, 0.0, 0.0], [1.0, -1.0, 0.5]]);
        assert!(!manager.is_connected());
        server.join().unwrap();
    }

    #[test]
    fn requests_arrive_intact() {
        let sizes = [0usize, 1, 7, 1000];
        let (tx, rx) = mpsc::channel();
        let (endpoint, server) = fake_server(move |listener| {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(stream);

            while let Some(req) = transport.read_request().unwrap() {
                let resp = ResponseFrame::new(req.n_atoms() as f64, vec![[0.0; 3]; req.n_atoms()]);
                tx.send(req).unwrap();
                transport.write_response(&resp).unwrap();
            }
        });

        let mut manager = ConnectionManager::new(endpoint, ReusePolicy::Persistent);
        for n_atoms in sizes {
            let frame = generated_frame(n_atoms);
            let resp = manager.evaluate(&frame).unwrap();

            assert_eq!(resp.energy, n_atoms as f64);
            assert_eq!(resp.n_atoms(), n_atoms);
            assert_eq!(rx.recv().unwrap(), frame);
        }

        manager.close();
        server.join().unwrap();
    }

    #[test]
    fn persistent_policy_connects_once() {
        let (endpoint, server) = fake_server(|listener| {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(stream);
            let mut served = 0;
            while let Some(req) = transport.read_request().unwrap() {
                served += 1;
                let resp = ResponseFrame::new(served as f64, vec![[0.0; 3]; req.n_atoms()]);
                transport.write_response(&resp).unwrap();
            }
            assert_eq!(served, 3);
        });

        let mut manager = ConnectionManager::new(endpoint, ReusePolicy::Persistent);
        manager.connect().unwrap();
        for step in 1..=3 {
            assert_eq!(manager.evaluate(&two_atoms()).unwrap().energy, step as f64);
            assert!(manager.is_connected());
        }

        manager.close();
        manager.close();
        server.join().unwrap();
    }

    #[test]
    fn per_call_policy_reconnects_every_step() {
        let (endpoint, server) = fake_server(|listener| {
            for step in 1..=3 {
                let (stream, _) = listener.accept().unwrap();
                let mut transport = ProtocolTransport::new(stream);
                let req = transport.read_request().unwrap().unwrap();
                let resp = ResponseFrame::new(step as f64, vec![[0.0; 3]; req.n_atoms()]);
                transport.write_response(&resp).unwrap();
                assert_eq!(transport.read_request().unwrap(), None);
            }
        });

        let mut manager = ConnectionManager::new(endpoint, ReusePolicy::PerCall);
        for step in 1..=3 {
            assert_eq!(manager.evaluate(&two_atoms()).unwrap().energy, step as f64);
            assert!(!manager.is_connected());
        }
        server.join().unwrap();
    }

    #[test]
    fn truncated_response_is_incomplete_transfer() {
        let (endpoint, server) = fake_server(|listener| {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(stream);
            transport.read_request().unwrap().unwrap();

            let mut stream = transport.into_inner();
            io::Write::write_all(&mut stream, &(-3.5f64).to_ne_bytes()).unwrap();
        });

        let mut manager = ConnectionManager::new(endpoint, ReusePolicy::Persistent);
        match manager.evaluate(&two_atoms()) {
            Err(TransportError::IncompleteTransfer { expected, received }) => {
                assert_eq!(expected, 56);
                assert_eq!(received, 8);
            }
            other => panic!("expected incomplete transfer, got {other:?}"),
        }
        assert!(!manager.is_connected());
        server.join().unwrap();
    }

    #[test]
    fn silent_peer_times_out() {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let (endpoint, server) = fake_server(move |listener| {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(stream);
            transport.read_request().unwrap().unwrap();
            // hold the stream open until the client gave up
            done_rx.recv().unwrap();
        });

        let endpoint = endpoint.with_recv_timeout(Some(Duration::from_millis(200)));
        let mut manager = ConnectionManager::new(endpoint, ReusePolicy::Persistent);

        let started = Instant::now();
        let err = manager.evaluate(&two_atoms()).unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, TransportError::RecvTimeout), "got {err:?}");
        assert!(elapsed >= Duration::from_millis(150), "gave up after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "gave up after {elapsed:?}");

        done_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn missing_listener_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        drop(listener);

        let err = Connection::open(&endpoint).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }), "got {err:?}");

        let mut manager = ConnectionManager::new(endpoint, ReusePolicy::Persistent);
        assert!(matches!(
            manager.evaluate(&two_atoms()),
            Err(TransportError::Connect { .. })
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (endpoint, server) = fake_server(|listener| {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(stream);
            assert_eq!(transport.read_request().unwrap(), None);
        });

        let mut connection = Connection::open(&endpoint).unwrap();
        assert!(connection.is_open());
        assert_eq!(connection.peer(), endpoint.to_string());
        connection.close();
        connection.close();
        assert!(!connection.is_open());
        assert!(matches!(
            connection.exchange(&two_atoms()),
            Err(TransportError::Send(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn zero_timeouts_are_timeout_config_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());

        let err = Connection::open(&endpoint.clone().with_send_timeout(Some(Duration::ZERO)))
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::TimeoutConfig {
                key: SEND_TIMEOUT_KEY,
                ..
            }
        ));

        let err = Connection::open(&endpoint.with_recv_timeout(Some(Duration::ZERO))).unwrap_err();
        assert!(matches!(
            err,
            TransportError::TimeoutConfig {
                key: RECV_TIMEOUT_KEY,
                ..
            }
        ));
    }

    #[test]
    fn endpoint_defaults() {
        let endpoint = Endpoint::new("127.0.0.1", 12345);
        assert_eq!(endpoint.send_timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(endpoint.recv_timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(endpoint.to_string(), "127.0.0.1:12345");
    }
}
