use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use thiserror::Error;

use super::{
    DEFAULT_TIMEOUT, ProtocolTransport, RequestFrame, ResponseFrame, ThreadPool, TransportError,
    transport::DEFAULT_MAX_ATOMS,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PotentialError {
    #[error("unsupported species code {0}")]
    UnknownSpecies(i32),

    #[error("model failed: {0}")]
    Failed(String),
}

/// Something that turns an atomic configuration into an energy and forces.
pub trait Potential: Send + Sync {
    fn compute(&self, frame: &RequestFrame) -> Result<ResponseFrame, PotentialError>;
}

impl<F> Potential for F
where
    F: Fn(&RequestFrame) -> Result<ResponseFrame, PotentialError> + Send + Sync,
{
    fn compute(&self, frame: &RequestFrame) -> Result<ResponseFrame, PotentialError> {
        self(frame)
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Number of client connections served concurrently.
    pub workers: usize,
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub max_atoms: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            recv_timeout: Some(DEFAULT_TIMEOUT),
            send_timeout: Some(DEFAULT_TIMEOUT),
            max_atoms: DEFAULT_MAX_ATOMS,
        }
    }
}

/// Serves evaluation requests from a [`Potential`].
///
/// Every accepted connection is handed to a worker thread which answers requests until the
/// client disconnects. A malformed request or a failing potential drops that connection only.
pub struct ModelServer {
    listener: TcpListener,
    potential: Arc<dyn Potential>,
    options: ServerOptions,
    pool: ThreadPool,
}

impl ModelServer {
    pub fn bind<A: ToSocketAddrs>(
        address: A,
        potential: Arc<dyn Potential>,
        options: ServerOptions,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address)?;
        let pool = ThreadPool::new(options.workers.max(1));

        Ok(Self {
            listener,
            potential,
            options,
            pool,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` is set, then waits for open connections to finish.
    pub fn listen_until(self, shutdown: Arc<AtomicBool>) -> io::Result<()> {
        info!(
            "listening at {} with {} workers",
            self.local_addr()?,
            self.pool.size()
        );
        self.listener.set_nonblocking(true)?;

        while !shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.configure(&stream) {
                        warn!("dropping connection from {peer}: {e}");
                        continue;
                    }
                    info!("client connected from {peer}");

                    let potential = Arc::clone(&self.potential);
                    let max_atoms = self.options.max_atoms;
                    self.pool.execute(move || {
                        match handle_connection(stream, potential.as_ref(), max_atoms) {
                            Ok(()) => info!("client {peer} disconnected"),
                            Err(e) => warn!("connection from {peer} dropped: {e}"),
                        }
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("shutting down");
        Ok(())
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(self.options.recv_timeout)?;
        stream.set_write_timeout(self.options.send_timeout)?;
        stream.set_nodelay(true)
    }
}

fn handle_connection(
    stream: TcpStream,
    potential: &dyn Potential,
    max_atoms: usize,
) -> Result<(), TransportError> {
    let mut transport = ProtocolTransport::new(stream).with_max_atoms(max_atoms);

    while let Some(req) = transport.read_request()? {
        let started = Instant::now();
        let resp = potential
            .compute(&req)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        if resp.n_atoms() != req.n_atoms() {
            return Err(TransportError::Protocol(format!(
                "potential returned {} forces for {} particles",
                resp.n_atoms(),
                req.n_atoms()
            )));
        }

        transport.write_response(&resp)?;
        debug!(
            "evaluated N={} in {:.2} ms",
            req.n_atoms(),
            started.elapsed().as_secs_f64() * 1000.0
        );
    }
    Ok(())
}
